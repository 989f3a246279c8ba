use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::trace;

use crate::clock::{AtomicF64, Clock, NOSYNC_THRESHOLD, SerialCell};
use crate::options::SyncMode;

use super::frame::Frame;

/// Below this diff no correction is attempted.
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Above this diff correction kicks in regardless of frame duration.
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are not duplicated to compensate, only delayed.
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// Maximum audio speed change factor, in percent of the frame's samples.
pub const SAMPLE_CORRECTION_PERCENT_MAX: f64 = 10.0;
/// Averaging window of the audio drift filter.
pub const AUDIO_DIFF_AVG_NB: u32 = 20;

/// External clock speed adaptation bounds.
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
/// Queue fill levels steering the external clock.
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

/// The three clocks plus everything needed to pick and query the master.
pub struct SyncState {
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,
    mode: SyncMode,
    has_audio: AtomicBool,
    has_video: AtomicBool,
    /// 10s for containers with discontinuities, 3600s otherwise.
    max_frame_duration: AtomicF64,
    /// Drop policy: 1 always, 0 never, -1 when video is not master.
    framedrop: i32,
    pub frame_drops_early: AtomicUsize,
    pub frame_drops_late: AtomicUsize,
    /// Times the scheduler held a frame for a second period to let the
    /// master catch up.
    pub frame_dups: AtomicUsize,
}

impl SyncState {
    pub fn new(
        mode: SyncMode,
        framedrop: i32,
        audioq_serial: Arc<SerialCell>,
        videoq_serial: Arc<SerialCell>,
    ) -> Self {
        Self {
            audclk: Clock::new(audioq_serial),
            vidclk: Clock::new(videoq_serial),
            extclk: Clock::standalone(),
            mode,
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
            max_frame_duration: AtomicF64::new(3600.0),
            framedrop,
            frame_drops_early: AtomicUsize::new(0),
            frame_drops_late: AtomicUsize::new(0),
            frame_dups: AtomicUsize::new(0),
        }
    }

    pub fn set_has_audio(&self, present: bool) {
        self.has_audio.store(present, Ordering::Release);
    }

    pub fn set_has_video(&self, present: bool) {
        self.has_video.store(present, Ordering::Release);
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio.load(Ordering::Acquire)
    }

    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::Acquire)
    }

    pub fn set_max_frame_duration(&self, value: f64) {
        self.max_frame_duration.store(value, Ordering::Release);
    }

    pub fn max_frame_duration(&self) -> f64 {
        self.max_frame_duration.load(Ordering::Acquire)
    }

    /// The mode actually in effect, demoted when the requested stream is
    /// missing.
    pub fn master_kind(&self) -> SyncMode {
        match self.mode {
            SyncMode::Video => {
                if self.has_video.load(Ordering::Acquire) {
                    SyncMode::Video
                } else {
                    SyncMode::Audio
                }
            }
            SyncMode::Audio => {
                if self.has_audio.load(Ordering::Acquire) {
                    SyncMode::Audio
                } else {
                    SyncMode::External
                }
            }
            SyncMode::External => SyncMode::External,
        }
    }

    pub fn master_clock(&self) -> f64 {
        match self.master_kind() {
            SyncMode::Audio => self.audclk.get(),
            SyncMode::Video => self.vidclk.get(),
            SyncMode::External => self.extclk.get(),
        }
    }

    /// Whether late/early video frames may be dropped right now.
    pub fn drop_frames(&self) -> bool {
        self.framedrop > 0 || (self.framedrop != 0 && self.master_kind() != SyncMode::Video)
    }

    /// How long to wait before showing the next video frame, given the
    /// nominal duration `delay` of the one on screen.
    pub fn compute_target_delay(&self, delay: f64) -> f64 {
        let mut delay = delay;

        if self.master_kind() != SyncMode::Video {
            // Video is a slave; shrink or stretch the delay to chase the
            // master, inside the sync thresholds.
            let diff = self.vidclk.get() - self.master_clock();
            let sync_threshold = delay.clamp(SYNC_THRESHOLD_MIN, SYNC_THRESHOLD_MAX);
            if !diff.is_nan() && diff.abs() < self.max_frame_duration() {
                if diff <= -sync_threshold {
                    delay = 0f64.max(delay + diff);
                } else if diff >= sync_threshold && delay > SYNC_FRAMEDUP_THRESHOLD {
                    delay += diff;
                } else if diff >= sync_threshold {
                    delay = 2.0 * delay;
                    self.frame_dups.fetch_add(1, Ordering::Relaxed);
                }
            }
            trace!(delay, diff, "video target delay");
        }

        delay
    }

    /// Nudge the external clock so queues neither starve nor overflow.
    /// Packet counts are `None` for absent streams.
    pub fn check_external_clock_speed(
        &self,
        video_packets: Option<usize>,
        audio_packets: Option<usize>,
    ) {
        let starving = |n: Option<usize>| n.is_some_and(|n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
        let saturated = |n: Option<usize>| n.is_none_or(|n| n > EXTERNAL_CLOCK_MAX_FRAMES);

        let speed = self.extclk.speed();
        if starving(video_packets) || starving(audio_packets) {
            self.extclk
                .set_speed(EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP));
        } else if saturated(video_packets) && saturated(audio_packets) {
            self.extclk
                .set_speed(EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP));
        } else if speed != 1.0 {
            // Ease back toward realtime.
            self.extclk
                .set_speed(speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs());
        }
    }
}

/// Time between two queued frames, falling back to the stored duration
/// across serial changes or absurd gaps.
pub fn vp_duration(frame: &Frame, next: &Frame, max_frame_duration: f64) -> f64 {
    if frame.serial == next.serial {
        let duration = next.pts - frame.pts;
        if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
            frame.duration
        } else {
            duration
        }
    } else {
        0.0
    }
}

/// Exponentially weighted audio drift filter.
///
/// When audio is not the master, each frame's clock difference feeds the
/// accumulator; once enough samples are in, a stable average decides how
/// many samples the resampler should produce to close the gap.
pub struct AudioCompensator {
    avg_coef: f64,
    diff_threshold: f64,
    cum: f64,
    avg_count: u32,
}

impl AudioCompensator {
    /// `diff_threshold` is the hardware buffer latency in seconds; smaller
    /// drift than that is inaudible and left alone.
    pub fn new(diff_threshold: f64) -> Self {
        Self {
            avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            diff_threshold,
            cum: 0.0,
            avg_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.avg_count = 0;
    }

    /// Desired output sample count for a frame of `nb_samples`, given the
    /// current audio-minus-master clock difference.
    pub fn wanted_samples(&mut self, nb_samples: usize, diff: f64, src_freq: u32) -> usize {
        if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
            // Too far gone to rate-match; restart the filter.
            self.reset();
            return nb_samples;
        }

        self.cum = diff + self.avg_coef * self.cum;
        if self.avg_count < AUDIO_DIFF_AVG_NB {
            self.avg_count += 1;
            return nb_samples;
        }

        let avg_diff = self.cum * (1.0 - self.avg_coef);
        if avg_diff.abs() < self.diff_threshold {
            return nb_samples;
        }

        let wanted = nb_samples as f64 + diff * src_freq as f64;
        let min = nb_samples as f64 * (100.0 - SAMPLE_CORRECTION_PERCENT_MAX) / 100.0;
        let max = nb_samples as f64 * (100.0 + SAMPLE_CORRECTION_PERCENT_MAX) / 100.0;
        trace!(avg_diff, wanted, "audio rate compensation");
        wanted.clamp(min, max) as usize
    }
}
