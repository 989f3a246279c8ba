use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{SerialCell, now_seconds, sync_clock_to_slave};
use crate::options::SyncMode;
use crate::playback::frame_queue::FrameQueue;
use crate::playback::sync::{AudioCompensator, SyncState};

use super::resample::LinearResampler;
use super::AudioParams;

/// Full scale of the integer volume range.
pub const MIX_MAX_VOLUME: i32 = 128;

/// Bytes of silence emitted when no frame is ready in time.
const SILENCE_QUANTUM_FRAMES: usize = 256;

struct PumpState {
    configured: bool,
    src: AudioParams,
    tgt: AudioParams,
    hw_buf_size: usize,
    resampler: Option<LinearResampler>,
    comp: AudioCompensator,
    /// Resampled S16 bytes being copied out across callbacks.
    buf: Vec<u8>,
    buf_index: usize,
    /// True while `buf` holds filler silence rather than decoded audio.
    silent: bool,
    /// End-of-frame pts of the last decoded frame, in seconds.
    audio_clock: Option<f64>,
    audio_clock_serial: i32,
}

/// Feeds the audio sink from the sample frame queue.
///
/// Owned jointly by the session and the sink's callback thread; `fill` runs
/// on the latter. Consumes frames, applies drift compensation through the
/// resampler, mixes volume, and keeps the audio clock honest about the
/// hardware buffer latency.
pub struct AudioPump {
    sampq: Arc<FrameQueue>,
    /// Live serial of the audio packet queue.
    queue_serial: Arc<SerialCell>,
    sync: Arc<SyncState>,
    volume: Arc<AtomicI32>,
    muted: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    /// Whether drift compensation has ever changed a frame's sample count.
    comp_engaged: AtomicBool,
    /// Largest per-frame sample adjustment seen, in thousandths of the
    /// frame's sample count.
    comp_max_per_mille: AtomicUsize,
    state: Mutex<PumpState>,
}

impl AudioPump {
    pub fn new(
        sampq: Arc<FrameQueue>,
        queue_serial: Arc<SerialCell>,
        sync: Arc<SyncState>,
        volume: Arc<AtomicI32>,
        muted: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sampq,
            queue_serial,
            sync,
            volume,
            muted,
            paused,
            comp_engaged: AtomicBool::new(false),
            comp_max_per_mille: AtomicUsize::new(0),
            state: Mutex::new(PumpState {
                configured: false,
                src: AudioParams {
                    freq: 0,
                    channels: 0,
                },
                tgt: AudioParams {
                    freq: 0,
                    channels: 0,
                },
                hw_buf_size: 0,
                resampler: None,
                comp: AudioCompensator::new(0.0),
                buf: Vec::new(),
                buf_index: 0,
                silent: false,
                audio_clock: None,
                audio_clock_serial: -1,
            }),
        })
    }

    /// Called once the sink reports what the device actually granted.
    pub fn configure(&self, tgt: AudioParams, hw_buf_size: usize) {
        let mut st = self.state.lock();
        st.tgt = tgt;
        st.hw_buf_size = hw_buf_size;
        st.comp = AudioCompensator::new(hw_buf_size as f64 / tgt.bytes_per_sec() as f64);
        st.resampler = None;
        st.buf.clear();
        st.buf_index = 0;
        st.configured = true;
    }

    /// Bytes still buffered after the last callback; exposed for tests and
    /// diagnostics.
    pub fn write_buf_size(&self) -> usize {
        let st = self.state.lock();
        st.buf.len() - st.buf_index
    }

    /// Whether drift compensation has resized any frame so far.
    pub fn compensation_engaged(&self) -> bool {
        self.comp_engaged.load(Ordering::Relaxed)
    }

    /// Largest per-frame sample adjustment seen, in thousandths of the
    /// frame's sample count. The compensator clamps this to 100.
    pub fn max_compensation_per_mille(&self) -> usize {
        self.comp_max_per_mille.load(Ordering::Relaxed)
    }

    /// The sink callback: fill `out` with S16 bytes.
    pub fn fill(&self, out: &mut [u8]) {
        let callback_time = now_seconds();
        let mut st = self.state.lock();

        if !st.configured {
            out.fill(0);
            return;
        }

        let mut offset = 0;
        while offset < out.len() {
            if st.buf_index >= st.buf.len() {
                if self.decode_next_audio_frame(&mut st, callback_time).is_err() {
                    // Keep the device fed; a short silent quantum rides out
                    // the underrun.
                    let frame_size = st.tgt.frame_size();
                    st.buf = vec![0u8; SILENCE_QUANTUM_FRAMES * frame_size];
                    st.buf_index = 0;
                    st.silent = true;
                }
            }

            let len = (st.buf.len() - st.buf_index).min(out.len() - offset);
            self.mix(
                &mut out[offset..offset + len],
                &st.buf[st.buf_index..st.buf_index + len],
                st.silent,
            );
            offset += len;
            st.buf_index += len;
        }

        // The samples just handed over will only be heard after the
        // hardware buffer drains; date the clock accordingly.
        let write_buf_size = st.buf.len() - st.buf_index;
        if let Some(clock) = st.audio_clock {
            let latency =
                (2 * st.hw_buf_size + write_buf_size) as f64 / st.tgt.bytes_per_sec() as f64;
            self.sync
                .audclk
                .set_at(clock - latency, st.audio_clock_serial, callback_time);
            sync_clock_to_slave(&self.sync.extclk, &self.sync.audclk);
        }
    }

    fn mix(&self, out: &mut [u8], src: &[u8], silent: bool) {
        let volume = self.volume.load(Ordering::Acquire);
        if silent || self.muted.load(Ordering::Acquire) || volume == 0 {
            out.fill(0);
            return;
        }
        if volume == MIX_MAX_VOLUME {
            out.copy_from_slice(src);
            return;
        }
        // Byte slices are not i16-aligned, so scale sample by sample.
        for (o, s) in out.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
            let sample = i16::from_ne_bytes([s[0], s[1]]) as i32;
            let scaled = (sample * volume / MIX_MAX_VOLUME) as i16;
            o.copy_from_slice(&scaled.to_ne_bytes());
        }
    }

    /// Pull the next live frame from the queue, resample it to the target
    /// format at the compensated length, and stage the bytes.
    fn decode_next_audio_frame(
        &self,
        st: &mut PumpState,
        callback_time: f64,
    ) -> Result<(), ()> {
        if self.paused.load(Ordering::Acquire) {
            return Err(());
        }

        let frame = loop {
            while self.sampq.nb_remaining() == 0 {
                // Don't stall the device thread: give up once waiting would
                // eat half the hardware buffer.
                let patience = st.hw_buf_size as f64 / st.tgt.bytes_per_sec() as f64 / 2.0;
                if now_seconds() - callback_time > patience {
                    return Err(());
                }
                thread::sleep(Duration::from_millis(1));
            }
            let frame = self.sampq.peek().ok_or(())?;
            if frame.serial != self.queue_serial.get() {
                self.sampq.next();
                continue;
            }
            break frame;
        };

        let data = frame.as_audio().ok_or(())?;
        let nb_samples = data.nb_samples();

        // Rate-match against the master clock unless audio is the master.
        let wanted = if self.sync.master_kind() != SyncMode::Audio {
            let diff = self.sync.audclk.get() - self.sync.master_clock();
            st.comp.wanted_samples(nb_samples, diff, data.sample_rate)
        } else {
            nb_samples
        };
        if nb_samples > 0 && wanted != nb_samples {
            self.comp_engaged.store(true, Ordering::Relaxed);
            self.comp_max_per_mille.fetch_max(
                wanted.abs_diff(nb_samples) * 1000 / nb_samples,
                Ordering::Relaxed,
            );
        }

        let src = AudioParams {
            freq: data.sample_rate,
            channels: data.channels,
        };
        if st.resampler.as_ref().is_none_or(|r| r.src() != src) {
            debug!(
                freq = src.freq,
                channels = src.channels,
                "audio source format changed, reconfiguring resampler"
            );
            st.resampler = Some(LinearResampler::new(src, st.tgt));
            st.src = src;
        }

        let out_frames = (wanted as u64 * st.tgt.freq as u64 / src.freq as u64) as usize;
        let samples = st
            .resampler
            .as_ref()
            .expect("resampler configured above")
            .convert(&data.samples, out_frames);

        st.buf = bytemuck::cast_slice(&samples).to_vec();
        st.buf_index = 0;
        st.silent = false;
        st.audio_clock = (!frame.pts.is_nan())
            .then(|| frame.pts + nb_samples as f64 / data.sample_rate as f64);
        st.audio_clock_serial = frame.serial;

        self.sampq.next();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decode::PacketQueue;
    use crate::media::AudioData;
    use crate::options::SyncMode;
    use crate::playback::frame::Frame;
    use crate::playback::frame_queue::SAMPLE_QUEUE_SIZE;

    pub(crate) fn bare_pump() -> Arc<AudioPump> {
        let audioq = PacketQueue::new();
        let sampq = Arc::new(FrameQueue::new(
            SAMPLE_QUEUE_SIZE,
            true,
            audioq.abort_flag(),
        ));
        let sync = Arc::new(SyncState::new(
            SyncMode::Audio,
            -1,
            audioq.serial_cell(),
            audioq.serial_cell(),
        ));
        AudioPump::new(
            sampq,
            audioq.serial_cell(),
            sync,
            Arc::new(AtomicI32::new(MIX_MAX_VOLUME)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    struct Rig {
        audioq: Arc<PacketQueue>,
        sampq: Arc<FrameQueue>,
        sync: Arc<SyncState>,
        volume: Arc<AtomicI32>,
        pump: Arc<AudioPump>,
    }

    fn rig() -> Rig {
        let audioq = Arc::new(PacketQueue::new());
        audioq.start();
        let sampq = Arc::new(FrameQueue::new(
            SAMPLE_QUEUE_SIZE,
            true,
            audioq.abort_flag(),
        ));
        let sync = Arc::new(SyncState::new(
            SyncMode::Audio,
            -1,
            audioq.serial_cell(),
            audioq.serial_cell(),
        ));
        sync.set_has_audio(true);
        let volume = Arc::new(AtomicI32::new(MIX_MAX_VOLUME));
        let pump = AudioPump::new(
            Arc::clone(&sampq),
            audioq.serial_cell(),
            Arc::clone(&sync),
            Arc::clone(&volume),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        pump.configure(
            AudioParams {
                freq: 48000,
                channels: 2,
            },
            4096,
        );
        Rig {
            audioq,
            sampq,
            sync,
            volume,
            pump,
        }
    }

    fn i16_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect()
    }

    fn audio_frame(pts: f64, nb_samples: usize, value: f32, serial: i32) -> Frame {
        Frame::audio(
            AudioData {
                samples: Arc::new(vec![value; nb_samples * 2]),
                channels: 2,
                sample_rate: 48000,
                pts: None,
                pos: -1,
            },
            pts,
            nb_samples as f64 / 48000.0,
            -1,
            serial,
        )
    }

    #[test]
    fn fills_from_queued_frames_and_updates_clock() {
        let rig = rig();
        rig.sampq.push(audio_frame(1.0, 512, 0.5, 1)).unwrap();

        let mut out = vec![0u8; 512 * 4];
        rig.pump.fill(&mut out);

        let samples = i16_samples(&out);
        assert!(samples.iter().all(|&s| s == (0.5 * i16::MAX as f32) as i16));

        // Clock anchored at frame end minus hardware latency.
        let clock = rig.sync.audclk.get();
        let bytes_per_sec = 48000.0 * 4.0;
        let expected = 1.0 + 512.0 / 48000.0 - (2.0 * 4096.0) / bytes_per_sec;
        assert!((clock - expected).abs() < 0.01, "clock {clock} vs {expected}");
    }

    #[test]
    fn stale_frames_are_skipped() {
        let rig = rig();
        rig.sampq.push(audio_frame(0.0, 256, 1.0, 0)).unwrap();
        rig.sampq.push(audio_frame(5.0, 256, 0.25, 1)).unwrap();

        let mut out = vec![0u8; 256 * 4];
        rig.pump.fill(&mut out);

        let samples = i16_samples(&out);
        // Only the serial-1 frame may be heard.
        assert!(samples.iter().all(|&s| s == (0.25 * i16::MAX as f32) as i16));
    }

    #[test]
    fn underrun_yields_silence() {
        let rig = rig();
        let mut out = vec![7u8; 128];
        rig.pump.fill(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn volume_scales_output() {
        let rig = rig();
        rig.volume.store(MIX_MAX_VOLUME / 2, Ordering::Release);
        rig.sampq.push(audio_frame(0.0, 128, 1.0, 1)).unwrap();

        let mut out = vec![0u8; 128 * 4];
        rig.pump.fill(&mut out);

        let samples = i16_samples(&out);
        let full = i16::MAX as i32;
        assert!(samples.iter().all(|&s| (s as i32 - full / 2).abs() <= 1));
    }

    #[test]
    fn leftover_bytes_survive_across_callbacks() {
        let rig = rig();
        rig.sampq.push(audio_frame(0.0, 512, 0.5, 1)).unwrap();

        let mut first = vec![0u8; 100];
        rig.pump.fill(&mut first);
        assert_eq!(rig.pump.write_buf_size(), 512 * 4 - 100);
    }
}
