use clap::ValueEnum;

/// Which clock the others synchronise against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    /// Follow the audio clock (default).
    Audio,
    /// Follow the video clock.
    Video,
    /// Follow the free-running external clock.
    #[value(name = "ext")]
    External,
}

/// Library-level playback configuration.
///
/// The CLI maps user flags into this type so the library stays usable from
/// tests and other frontends without a command line.
#[derive(Clone, Debug)]
pub struct PlayerOptions {
    /// Input URL handed to the media opener.
    pub input: String,

    pub disable_audio: bool,
    pub disable_video: bool,
    pub disable_subtitles: bool,

    /// Playback start offset in microseconds.
    pub start_time: Option<i64>,
    /// Maximum play duration in microseconds.
    pub play_duration: Option<i64>,

    /// Seek by bytes instead of time: 0 never, 1 always, -1 let the
    /// container decide.
    pub seek_by_bytes: i32,

    pub sync: SyncMode,

    /// Number of playthroughs; 0 loops forever.
    pub loop_count: i32,
    /// Exit once the last playthrough reaches end of stream.
    pub autoexit: bool,

    /// Drop late video frames: 1 always, 0 never, -1 only when video is not
    /// the master clock.
    pub framedrop: i32,
    /// Ignore queue limits: 1 always, 0 never, -1 only for realtime inputs.
    pub infinite_buffer: i32,

    /// Startup volume, 0..=100.
    pub volume: i32,

    /// Ask decoders for reduced-resolution output.
    pub lowres: i32,
    /// Allow non-compliant codec speedups.
    pub fast: bool,
    /// Ask the demuxer to generate missing pts.
    pub genpts: bool,
    /// Video frame timestamp selection: -1 best effort, 0 decode order,
    /// 1 presentation order.
    pub decoder_reorder_pts: i32,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            input: String::new(),
            disable_audio: false,
            disable_video: false,
            disable_subtitles: false,
            start_time: None,
            play_duration: None,
            seek_by_bytes: -1,
            sync: SyncMode::Audio,
            loop_count: 1,
            autoexit: false,
            framedrop: -1,
            infinite_buffer: -1,
            volume: 100,
            lowres: 0,
            fast: false,
            genpts: false,
            decoder_reorder_pts: -1,
        }
    }
}

impl PlayerOptions {
    /// Options the media layer cares about when opening inputs and decoders.
    pub fn media_options(&self) -> crate::media::MediaOptions {
        crate::media::MediaOptions {
            genpts: self.genpts,
            fast: self.fast,
            lowres: self.lowres,
        }
    }
}
