//! The abstract audio sink, device-open fallback, and the output pump.
//!
//! The sink owns the callback thread and periodically asks the pump for
//! S16 interleaved PCM bytes. The actual device format may differ from the
//! requested one; the pump adapts through the resampler.

pub mod output;
pub mod pump;
pub mod resample;

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::error::PlayerError;

pub use output::CpalAudioSink;
pub use pump::{AudioPump, MIX_MAX_VOLUME};
pub use resample::LinearResampler;

#[derive(Debug, Error)]
pub enum AudioSinkError {
    #[error("no audio device")]
    NoDevice,

    #[error("format not supported: {0}")]
    Unsupported(String),

    #[error("device error: {0}")]
    Device(String),
}

/// Sample format is fixed at interleaved native-endian S16.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioParams {
    pub freq: u32,
    pub channels: u16,
}

impl AudioParams {
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn frame_size(&self) -> usize {
        self.channels as usize * Self::BYTES_PER_SAMPLE
    }

    pub fn bytes_per_sec(&self) -> usize {
        self.freq as usize * self.frame_size()
    }
}

/// What the device actually granted.
#[derive(Clone, Copy, Debug)]
pub struct AudioSinkOpen {
    pub params: AudioParams,
    /// Size of the hardware buffer in bytes; drives clock latency
    /// correction and the drift threshold.
    pub buffer_bytes: usize,
}

pub trait AudioSink: Send + Sync {
    /// Open the device as close to `wanted` as possible and start calling
    /// `pump.fill` from the device thread.
    fn open(&self, wanted: AudioParams, pump: Arc<AudioPump>)
    -> Result<AudioSinkOpen, AudioSinkError>;

    fn pause(&self, paused: bool);

    fn close(&self);
}

/// Channel-count downgrade ladder, indexed by the failing channel count.
const NEXT_NB_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
/// Rate downgrade ladder; index 0 is the give-up marker.
const NEXT_SAMPLE_RATES: [u32; 5] = [0, 44100, 48000, 96000, 192000];

/// Open the sink, walking the channel-count and sample-rate fallback
/// ladders until something is accepted.
pub fn audio_open(
    sink: &dyn AudioSink,
    wanted: AudioParams,
    pump: Arc<AudioPump>,
) -> Result<AudioSinkOpen, PlayerError> {
    if wanted.freq == 0 || wanted.channels == 0 {
        return Err(PlayerError::init("invalid audio parameters"));
    }

    let orig_channels = wanted.channels;
    let mut channels = wanted.channels;
    let mut freq = wanted.freq;

    let mut rate_idx = NEXT_SAMPLE_RATES.len() - 1;
    while rate_idx > 0 && NEXT_SAMPLE_RATES[rate_idx] >= freq {
        rate_idx -= 1;
    }

    loop {
        match sink.open(AudioParams { freq, channels }, Arc::clone(&pump)) {
            Ok(open) => return Ok(open),
            Err(err) => {
                warn!(freq, channels, %err, "audio open failed, trying fallback");
                channels = NEXT_NB_CHANNELS[channels.min(7) as usize];
                if channels == 0 {
                    freq = NEXT_SAMPLE_RATES[rate_idx];
                    rate_idx = rate_idx.saturating_sub(1);
                    channels = orig_channels;
                    if freq == 0 {
                        return Err(PlayerError::BackendRefusal(
                            "no usable channel count / sample rate combination".into(),
                        ));
                    }
                }
            }
        }
    }
}

/// Sink that accepts any format and never invokes the pump. Tests drive the
/// pump by hand; headless runs use it to play without a device.
pub struct NullAudioSink {
    /// Hardware buffer the fake device pretends to have, in frames.
    buffer_frames: usize,
}

impl NullAudioSink {
    pub fn new() -> Self {
        Self {
            buffer_frames: 1024,
        }
    }
}

impl Default for NullAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullAudioSink {
    fn open(
        &self,
        wanted: AudioParams,
        _pump: Arc<AudioPump>,
    ) -> Result<AudioSinkOpen, AudioSinkError> {
        Ok(AudioSinkOpen {
            params: wanted,
            buffer_bytes: self.buffer_frames * wanted.frame_size(),
        })
    }

    fn pause(&self, _paused: bool) {}

    fn close(&self) {}
}
