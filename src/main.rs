/*!
    vidplay

    Headless media player over the synthetic backend.

    Usage:
      vidplay synth:dur=5,fps=30,rate=48000
      vidplay -sync video -loop 3 -autoexit synth:dur=2

    Real containers and codecs plug in behind the media traits; this
    binary wires up the synthetic opener, cpal audio output and a null
    video sink.
*/

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;

use vidplay::audio::{AudioSink, CpalAudioSink, NullAudioSink};
use vidplay::media::synth::SynthOpener;
use vidplay::options::{PlayerOptions, SyncMode};
use vidplay::session::{ExitReason, Session};
use vidplay::video::NullVideoSink;

const EXIT_INIT_FAILURE: u8 = 1;
/// Reserved for the signal path.
#[allow(dead_code)]
const EXIT_SIGNAL: u8 = 123;

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

#[derive(Parser, Debug)]
#[command(name = "vidplay", about = "simple synthetic media player")]
struct Cli {
    /// Input URL (synth:...)
    input: String,

    /// Disable audio
    #[arg(long = "an", default_value_t = false)]
    no_audio: bool,

    /// Disable video
    #[arg(long = "vn", default_value_t = false)]
    no_video: bool,

    /// Disable subtitles
    #[arg(long = "sn", default_value_t = false)]
    no_subtitles: bool,

    /// Start offset in microseconds
    #[arg(long = "ss")]
    start_time: Option<i64>,

    /// Play duration in microseconds
    #[arg(short = 't')]
    duration: Option<i64>,

    /// Seek by bytes: 0 never, 1 always, -1 auto
    #[arg(long = "bytes", default_value_t = -1, allow_hyphen_values = true)]
    seek_by_bytes: i32,

    /// Master clock
    #[arg(long = "sync", value_enum, default_value_t = SyncMode::Audio)]
    sync: SyncMode,

    /// Number of playthroughs, 0 = forever
    #[arg(long = "loop", default_value_t = 1)]
    loop_count: i32,

    /// Exit when playback ends
    #[arg(long = "autoexit", default_value_t = false)]
    autoexit: bool,

    /// Drop late video frames
    #[arg(long = "framedrop", default_value_t = false)]
    framedrop: bool,

    /// Ignore queue size limits
    #[arg(long = "infbuf", default_value_t = false)]
    infinite_buffer: bool,

    /// Startup volume 0..=100
    #[arg(long = "volume", default_value_t = 100)]
    volume: i32,

    /// Low resolution decoding factor
    #[arg(long = "lowres", default_value_t = 0)]
    lowres: i32,

    /// Non-spec-compliant codec speedups
    #[arg(long = "fast", default_value_t = false)]
    fast: bool,

    /// Generate missing pts
    #[arg(long = "genpts", default_value_t = false)]
    genpts: bool,

    /// Video timestamp source: -1 best effort, 0 dts, 1 pts
    #[arg(long = "drp", default_value_t = -1, allow_hyphen_values = true)]
    decoder_reorder_pts: i32,

    /// Play without an audio device (still decodes and clocks audio)
    #[arg(long = "nodisp-audio", default_value_t = false)]
    no_audio_device: bool,
}

impl Cli {
    fn into_options(self) -> PlayerOptions {
        PlayerOptions {
            input: self.input,
            disable_audio: self.no_audio,
            disable_video: self.no_video,
            disable_subtitles: self.no_subtitles,
            start_time: self.start_time,
            play_duration: self.duration,
            seek_by_bytes: self.seek_by_bytes,
            sync: self.sync,
            loop_count: self.loop_count,
            autoexit: self.autoexit,
            framedrop: if self.framedrop { 1 } else { -1 },
            infinite_buffer: if self.infinite_buffer { 1 } else { -1 },
            volume: self.volume,
            lowres: self.lowres,
            fast: self.fast,
            genpts: self.genpts,
            decoder_reorder_pts: self.decoder_reorder_pts,
        }
    }
}

/// Structured logging; `VIDPLAY_LOG` overrides the default level.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::builder()
        .with_env_var("VIDPLAY_LOG")
        .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

fn run() -> anyhow::Result<ExitReason> {
    let cli = Cli::parse();
    let use_device = !cli.no_audio_device && !cli.no_audio;
    let opts = cli.into_options();

    let audio_sink: Arc<dyn AudioSink> = if use_device {
        Arc::new(CpalAudioSink::new())
    } else {
        Arc::new(NullAudioSink::new())
    };
    let video_sink = Arc::new(NullVideoSink::new(DEFAULT_WIDTH, DEFAULT_HEIGHT));

    let (mut session, _commands) =
        Session::open(opts, Arc::new(SynthOpener), audio_sink, video_sink)
            .map_err(|e| anyhow!("{e}"))?;

    Ok(session.run())
}

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(ExitReason::Eof | ExitReason::Quit) => ExitCode::SUCCESS,
        Ok(ExitReason::Error) => ExitCode::from(EXIT_INIT_FAILURE),
        Err(err) => {
            eprintln!("vidplay: {err:#}");
            ExitCode::from(EXIT_INIT_FAILURE)
        }
    }
}
