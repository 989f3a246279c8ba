use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error};

use super::pump::AudioPump;
use super::{AudioParams, AudioSink, AudioSinkError, AudioSinkOpen};

/// Requested device buffer, in frames per channel.
const DEVICE_BUFFER_FRAMES: u32 = 1024;

enum SinkCtl {
    Pause(bool),
    Close,
}

/// cpal-backed audio sink.
///
/// cpal streams are not `Send` on every platform, so the stream lives on a
/// dedicated thread that owns it for its whole life and takes pause/close
/// requests over a channel.
pub struct CpalAudioSink {
    control: Mutex<Option<Sender<SinkCtl>>>,
}

impl CpalAudioSink {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(None),
        }
    }

    fn run_stream(
        wanted: AudioParams,
        pump: Arc<AudioPump>,
        ready: Sender<Result<AudioSinkOpen, AudioSinkError>>,
        ctl: Receiver<SinkCtl>,
    ) {
        let host = cpal::default_host();
        let Some(device) = host.default_output_device() else {
            let _ = ready.send(Err(AudioSinkError::NoDevice));
            return;
        };
        debug!(device = device.name().unwrap_or_default(), "audio device");

        let config = StreamConfig {
            channels: wanted.channels,
            sample_rate: SampleRate(wanted.freq),
            buffer_size: BufferSize::Fixed(DEVICE_BUFFER_FRAMES),
        };

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                pump.fill(bytemuck::cast_slice_mut(data));
            },
            |err| {
                error!(%err, "audio stream error");
            },
            None,
        );

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                let _ = ready.send(Err(AudioSinkError::Unsupported(err.to_string())));
                return;
            }
        };

        if let Err(err) = stream.play() {
            let _ = ready.send(Err(AudioSinkError::Device(err.to_string())));
            return;
        }

        let buffer_bytes = DEVICE_BUFFER_FRAMES as usize * wanted.frame_size();
        let _ = ready.send(Ok(AudioSinkOpen {
            params: wanted,
            buffer_bytes,
        }));

        // Park here owning the stream until close.
        while let Ok(msg) = ctl.recv() {
            match msg {
                SinkCtl::Pause(true) => {
                    let _ = stream.pause();
                }
                SinkCtl::Pause(false) => {
                    let _ = stream.play();
                }
                SinkCtl::Close => break,
            }
        }
    }
}

impl Default for CpalAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalAudioSink {
    fn open(
        &self,
        wanted: AudioParams,
        pump: Arc<AudioPump>,
    ) -> Result<AudioSinkOpen, AudioSinkError> {
        let (ready_tx, ready_rx) = bounded(1);
        let (ctl_tx, ctl_rx) = bounded(4);

        thread::Builder::new()
            .name("audio-sink".into())
            .spawn(move || Self::run_stream(wanted, pump, ready_tx, ctl_rx))
            .map_err(|e| AudioSinkError::Device(e.to_string()))?;

        let open = ready_rx
            .recv()
            .map_err(|_| AudioSinkError::Device("audio sink thread died".into()))??;

        *self.control.lock() = Some(ctl_tx);
        Ok(open)
    }

    fn pause(&self, paused: bool) {
        if let Some(ctl) = self.control.lock().as_ref() {
            let _ = ctl.send(SinkCtl::Pause(paused));
        }
    }

    fn close(&self) {
        if let Some(ctl) = self.control.lock().take() {
            let _ = ctl.send(SinkCtl::Close);
        }
    }
}
