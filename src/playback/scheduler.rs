use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::clock::{now_seconds, sync_clock_to_slave};
use crate::decode::PacketQueue;
use crate::options::SyncMode;
use crate::video::renderer::VideoRenderer;

use super::frame::Frame;
use super::frame_queue::FrameQueue;
use super::sync::{SYNC_THRESHOLD_MAX, SyncState, vp_duration};

/// Poll interval of the presentation loop, in seconds.
pub const REFRESH_RATE: f64 = 0.01;

/// Decides, on every tick of the event loop, whether the frame on screen
/// stays up, the next one goes up, or late frames get dropped.
///
/// Single-threaded; owns `frame_timer`, the wall-clock anchor of the frame
/// cadence.
pub struct Scheduler {
    pictq: Arc<FrameQueue>,
    subpq: Arc<FrameQueue>,
    videoq: Arc<PacketQueue>,
    subtitleq: Arc<PacketQueue>,
    audioq: Arc<PacketQueue>,
    sync: Arc<SyncState>,
    paused: Arc<AtomicBool>,
    force_refresh: Arc<AtomicBool>,
    realtime: Arc<AtomicBool>,
    frame_timer: f64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pictq: Arc<FrameQueue>,
        subpq: Arc<FrameQueue>,
        videoq: Arc<PacketQueue>,
        subtitleq: Arc<PacketQueue>,
        audioq: Arc<PacketQueue>,
        sync: Arc<SyncState>,
        paused: Arc<AtomicBool>,
        force_refresh: Arc<AtomicBool>,
        realtime: Arc<AtomicBool>,
    ) -> Self {
        Self {
            pictq,
            subpq,
            videoq,
            subtitleq,
            audioq,
            sync,
            paused,
            force_refresh,
            realtime,
            // Guarantees the very first frame is shown immediately; the
            // cadence snaps to wall clock right after.
            frame_timer: f64::NEG_INFINITY,
        }
    }

    /// Re-anchor the frame cadence; called when playback resumes.
    pub fn on_unpause(&mut self, now: f64) {
        self.frame_timer += now - self.sync.vidclk.last_updated();
    }

    /// One tick. Lowers `remaining_time` to the delay until this needs to
    /// run again.
    pub fn refresh(&mut self, renderer: &mut VideoRenderer, remaining_time: &mut f64) {
        let paused = self.paused.load(Ordering::Acquire);

        if !paused
            && self.sync.master_kind() == SyncMode::External
            && self.realtime.load(Ordering::Acquire)
        {
            self.sync.check_external_clock_speed(
                self.sync.has_video().then(|| self.videoq.nb_packets()),
                self.sync.has_audio().then(|| self.audioq.nb_packets()),
            );
        }

        if self.sync.has_video() {
            loop {
                if self.pictq.nb_remaining() == 0 {
                    // Nothing queued; keep whatever is on screen.
                    break;
                }

                let lastvp = self.pictq.peek_last().expect("ring is non-empty");
                let vp = self.pictq.peek().expect("ring is non-empty");

                if vp.serial != self.videoq.serial() {
                    // Leftover from before a seek.
                    self.pictq.next();
                    continue;
                }

                if lastvp.serial != vp.serial {
                    self.frame_timer = now_seconds();
                }

                if paused {
                    break;
                }

                let last_duration =
                    vp_duration(&lastvp, &vp, self.sync.max_frame_duration());
                let delay = self.sync.compute_target_delay(last_duration);

                let time = now_seconds();
                if time < self.frame_timer + delay {
                    *remaining_time = (self.frame_timer + delay - time).min(*remaining_time);
                    break;
                }

                self.frame_timer += delay;
                if delay > 0.0 && time - self.frame_timer > SYNC_THRESHOLD_MAX {
                    // Way behind cadence; restart it from now.
                    self.frame_timer = time;
                }

                if !vp.pts.is_nan() {
                    self.sync.vidclk.set(vp.pts, vp.serial);
                    sync_clock_to_slave(&self.sync.extclk, &self.sync.vidclk);
                }

                if self.pictq.nb_remaining() > 1 {
                    let nextvp = self.pictq.peek_next().expect("two frames queued");
                    let duration = vp_duration(&vp, &nextvp, self.sync.max_frame_duration());
                    if self.sync.drop_frames() && time > self.frame_timer + duration {
                        self.sync
                            .frame_drops_late
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(pts = vp.pts, "dropping late video frame");
                        self.pictq.next();
                        continue;
                    }
                }

                self.advance_subtitles(renderer);

                self.pictq.next();
                self.force_refresh.store(true, Ordering::Release);
                break;
            }

            if self.force_refresh.swap(false, Ordering::AcqRel) && self.pictq.rindex_shown() {
                if let Some(vp) = self.pictq.peek_last() {
                    let sub = self.current_subtitle(&vp);
                    renderer.display(&vp, sub.as_ref());
                }
            }
        } else {
            self.force_refresh.store(false, Ordering::Release);
        }
    }

    /// Release every queued subtitle that is stale or has played out
    /// relative to the video clock.
    fn advance_subtitles(&mut self, renderer: &mut VideoRenderer) {
        while self.subpq.nb_remaining() > 0 {
            let sp = self.subpq.peek().expect("subtitle queued");
            let sp2 = self.subpq.peek_next();

            let expired = sp.serial != self.subtitleq.serial()
                || self.sync.vidclk.pts() > sp.subtitle_end()
                || sp2
                    .as_ref()
                    .is_some_and(|next| self.sync.vidclk.pts() > next.subtitle_start());
            if !expired {
                break;
            }
            renderer.clear_subtitle();
            self.subpq.next();
        }
    }

    /// The subtitle to overlay on `vp`, if one is inside its display window.
    fn current_subtitle(&self, vp: &Frame) -> Option<Frame> {
        if self.subpq.nb_remaining() == 0 {
            return None;
        }
        let sp = self.subpq.peek()?;
        if sp.serial != self.subtitleq.serial() {
            return None;
        }
        (vp.pts.is_nan() || vp.pts >= sp.subtitle_start()).then_some(sp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Picture, PixelFormat};
    use crate::playback::frame_queue::VIDEO_PICTURE_QUEUE_SIZE;
    use crate::video::{NullVideoSink, renderer::VideoRenderer};

    struct Fixture {
        pictq: Arc<FrameQueue>,
        videoq: Arc<PacketQueue>,
        sync: Arc<SyncState>,
        scheduler: Scheduler,
        renderer: VideoRenderer,
    }

    fn fixture(mode: SyncMode) -> Fixture {
        let videoq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());
        let audioq = Arc::new(PacketQueue::new());
        videoq.start();
        subtitleq.start();
        audioq.start();

        let pictq = Arc::new(FrameQueue::new(
            VIDEO_PICTURE_QUEUE_SIZE,
            true,
            videoq.abort_flag(),
        ));
        let subpq = Arc::new(FrameQueue::new(4, false, subtitleq.abort_flag()));

        let sync = Arc::new(SyncState::new(
            mode,
            -1,
            audioq.serial_cell(),
            videoq.serial_cell(),
        ));
        sync.set_has_video(true);

        let scheduler = Scheduler::new(
            Arc::clone(&pictq),
            Arc::clone(&subpq),
            Arc::clone(&videoq),
            Arc::clone(&subtitleq),
            Arc::clone(&audioq),
            Arc::clone(&sync),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        let renderer = VideoRenderer::new(Arc::new(NullVideoSink::new(640, 480)));

        Fixture {
            pictq,
            videoq,
            sync,
            scheduler,
            renderer,
        }
    }

    fn picture_frame(pts: f64, serial: i32) -> Frame {
        Frame::video(
            Picture {
                format: PixelFormat::Bgra,
                width: 2,
                height: 2,
                data: Arc::new(vec![0u8; 16]),
            },
            pts,
            1.0 / 30.0,
            -1,
            serial,
        )
    }

    #[test]
    fn stale_frames_are_discarded_before_display() {
        let mut fx = fixture(SyncMode::Video);
        fx.pictq.push(picture_frame(0.0, 1)).unwrap();
        fx.pictq.push(picture_frame(0.033, 1)).unwrap();
        // Seek happened: queue serial moves to 2, a post-seek frame lands.
        fx.videoq.put_flush();
        fx.pictq.push(picture_frame(10.0, 2)).unwrap();

        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh(&mut fx.renderer, &mut remaining);

        // Only the serial-2 frame may be on screen.
        let shown = fx.pictq.peek_last().unwrap();
        assert_eq!(shown.serial, 2);
    }

    #[test]
    fn shows_first_frame_and_updates_video_clock() {
        let mut fx = fixture(SyncMode::Video);
        fx.pictq.push(picture_frame(0.5, 1)).unwrap();

        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh(&mut fx.renderer, &mut remaining);

        assert!(fx.pictq.rindex_shown());
        assert_eq!(fx.sync.vidclk.serial(), 1);
        assert!((fx.sync.vidclk.pts() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn early_next_frame_shortens_remaining_time_only() {
        let mut fx = fixture(SyncMode::Video);
        fx.pictq.push(picture_frame(0.0, 1)).unwrap();
        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh(&mut fx.renderer, &mut remaining);

        // Next frame nominally 10s out: scheduler must keep the current one
        // and not advance.
        fx.pictq.push(picture_frame(10.0, 1)).unwrap();
        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh(&mut fx.renderer, &mut remaining);
        assert_eq!(fx.pictq.nb_remaining(), 1);
        assert!(remaining <= REFRESH_RATE);
    }
}
