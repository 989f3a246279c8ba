//! The abstract media-IO layer.
//!
//! The player core treats demuxing and decoding as collaborators behind
//! traits: a demuxer produces [`Packet`]s, a per-stream decoder turns packets
//! into frames with drain semantics. Real container/codec backends plug in
//! here; the crate ships a deterministic synthetic backend in [`synth`].

pub mod synth;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

/// Container-level timestamps are expressed in microseconds.
pub const TIME_BASE_MICROS: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("open failed: {0}")]
    Open(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("seek failed: {0}")]
    Seek(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// A rational stream time base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MICROS: TimeBase = TimeBase::new(1, TIME_BASE_MICROS as i32);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Rescale `value` from this time base into `to`, rounding to nearest.
    pub fn rescale(self, value: i64, to: TimeBase) -> i64 {
        let num = value as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        let half = den.abs() / 2;
        let rounded = if num >= 0 { num + half } else { num - half } / den;
        rounded as i64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

/// Pixel layouts the video path understands.
///
/// `Bgra` and `Yuv420p` upload natively; everything else goes through the
/// cached scaler first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Yuv420p,
    Rgb24,
}

/// Per-kind codec parameters reported by the demuxer.
#[derive(Clone, Debug)]
pub enum StreamParams {
    Audio {
        sample_rate: u32,
        channels: u16,
    },
    Video {
        width: u32,
        height: u32,
        frame_rate: f64,
        pixel_format: PixelFormat,
        /// A single still image embedded in the container (album art). The
        /// reader re-queues it once per seek epoch.
        attached_picture: Option<Packet>,
    },
    Subtitle,
}

#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    /// First pts of the stream, in `time_base` units.
    pub start_time: Option<i64>,
    pub params: StreamParams,
}

impl StreamInfo {
    pub fn is_attached_picture(&self) -> bool {
        matches!(
            self.params,
            StreamParams::Video {
                attached_picture: Some(_),
                ..
            }
        )
    }
}

/// A demuxed unit: payload bytes plus timing.
///
/// An empty payload is the drain marker that tells a decoder to flush out
/// its remaining frames and report end of stream.
#[derive(Clone, Debug)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Arc<Vec<u8>>,
    /// Presentation timestamp in the stream time base.
    pub pts: Option<i64>,
    /// Decode timestamp in the stream time base.
    pub dts: Option<i64>,
    /// Duration in the stream time base.
    pub duration: i64,
    /// Byte position in the container, -1 if unknown.
    pub pos: i64,
}

impl Packet {
    pub fn drain(stream_index: usize) -> Self {
        Self {
            stream_index,
            data: Arc::new(Vec::new()),
            pts: None,
            dts: None,
            duration: 0,
            pos: -1,
        }
    }

    pub fn is_drain(&self) -> bool {
        self.data.is_empty()
    }

    /// The timestamp used for play-range checks: pts if present, else dts.
    pub fn ts(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Seek window handed to the demuxer. The min/max fudge exists because some
/// containers round the target in the wrong direction.
#[derive(Clone, Copy, Debug)]
pub struct SeekTarget {
    /// In microseconds, or bytes when `by_bytes`.
    pub min: i64,
    pub target: i64,
    pub max: i64,
    pub by_bytes: bool,
}

/// Knobs forwarded from the CLI into the media backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct MediaOptions {
    pub genpts: bool,
    pub fast: bool,
    pub lowres: i32,
}

/// An opened container.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Container duration in microseconds, if known.
    fn duration(&self) -> Option<i64>;

    /// Container start time in microseconds, if known.
    fn start_time(&self) -> Option<i64> {
        None
    }

    fn bit_rate(&self) -> Option<i64> {
        None
    }

    fn metadata(&self) -> &[(String, String)] {
        &[]
    }

    /// `Ok(None)` is end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError>;

    fn seek(&mut self, target: &SeekTarget) -> Result<(), MediaError>;

    /// Live sources drive external-clock speed adaptation.
    fn is_realtime(&self) -> bool {
        false
    }

    /// Whether the container may carry timestamp discontinuities.
    fn reports_discontinuities(&self) -> bool {
        false
    }
}

/// Outcome of pushing a packet into a decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// The decoder has frames to hand out first; the packet stays pending.
    Full,
}

/// Outcome of pulling a frame out of a decoder.
pub enum DecodePoll {
    Frame(DecodedFrame),
    /// Needs more input.
    Pending,
    /// Fully drained after a drain packet.
    Drained,
}

/// Interleaved f32 samples out of an audio decoder.
#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Arc<Vec<f32>>,
    pub channels: u16,
    pub sample_rate: u32,
    /// In the stream time base.
    pub pts: Option<i64>,
    /// Byte position of the originating packet, -1 if unknown.
    pub pos: i64,
}

impl AudioData {
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// A decoded picture. Planes are packed into one buffer:
/// BGRA/RGB24 row-major, YUV420P as Y then U then V.
#[derive(Clone, Debug)]
pub struct Picture {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct VideoData {
    pub picture: Picture,
    /// In the stream time base.
    pub pts: Option<i64>,
    /// The codec's best-effort presentation estimate.
    pub best_effort_ts: Option<i64>,
    /// Decode timestamp of the originating packet.
    pub pkt_dts: Option<i64>,
    pub pos: i64,
}

#[derive(Clone, Debug)]
pub struct SubtitleData {
    pub text: String,
    /// In microseconds.
    pub pts: Option<i64>,
    /// Display window relative to pts, in milliseconds.
    pub start_display_ms: u32,
    pub end_display_ms: u32,
}

#[derive(Clone, Debug)]
pub enum DecodedFrame {
    Audio(AudioData),
    Video(VideoData),
    Subtitle(SubtitleData),
}

/// One decoder instance per stream, with avcodec-style send/receive and
/// drain semantics: `send(None)` enters drain mode, `receive` then yields the
/// remaining frames followed by `Drained`.
pub trait StreamDecoder: Send {
    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, MediaError>;

    fn receive(&mut self) -> Result<DecodePoll, MediaError>;

    /// Discard all internal state. Used after a flush barrier.
    fn reset(&mut self);
}

/// Opens inputs and creates decoders. Doubles as the codec registry.
pub trait MediaOpener: Send + Sync {
    /// `interrupt` is polled during blocking IO; a set flag aborts the
    /// operation.
    fn open(
        &self,
        url: &str,
        options: &MediaOptions,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Box<dyn Demuxer>, MediaError>;

    fn new_decoder(
        &self,
        stream: &StreamInfo,
        options: &MediaOptions,
    ) -> Result<Box<dyn StreamDecoder>, MediaError>;
}
