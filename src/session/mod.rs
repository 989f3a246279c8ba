//! The session orchestrator: owns every queue, clock and thread, maps
//! commands onto domain actions, and runs the presentation loop.

mod reader;

pub use reader::{MAX_QUEUE_SIZE, MIN_FRAMES, SEEK_WINDOW_FUDGE};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{AudioPump, AudioSink, MIX_MAX_VOLUME};
use crate::clock::now_seconds;
use crate::decode::{PacketQueue, ReadSignal};
use crate::error::{PlayerError, Result};
use crate::media::{MediaOpener, TIME_BASE_MICROS};
use crate::options::PlayerOptions;
use crate::playback::frame_queue::{
    FrameQueue, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE,
};
use crate::playback::scheduler::{REFRESH_RATE, Scheduler};
use crate::playback::sync::SyncState;
use crate::video::VideoSink;
use crate::video::renderer::VideoRenderer;

/// Volume step per keypress.
const VOLUME_STEP: i32 = if MIX_MAX_VOLUME / 50 > 0 {
    MIX_MAX_VOLUME / 50
} else {
    1
};

/// Default relative seek of the arrow keys, in seconds.
pub const SEEK_STEP_SECS: f64 = 10.0;
/// Byte-domain seek speed assumed when the container reports no bit rate.
const FALLBACK_BYTES_PER_SEC: f64 = 180_000.0;

/// UI events mapped to domain actions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    TogglePause,
    ToggleMute,
    VolumeUp,
    VolumeDown,
    /// Relative seek in seconds (time mode) or scaled by bit rate (byte
    /// mode).
    SeekBy(f64),
    /// Absolute seek in seconds.
    SeekTo(f64),
    Resize(u32, u32),
    Quit,
}

/// Why `run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Played to the end with autoexit.
    Eof,
    /// Quit command or broken input.
    Quit,
    /// Session could not be brought up.
    Error,
}

pub(crate) enum SessionEnd {
    Eof,
    Error(PlayerError),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SeekRequest {
    /// Microseconds, or bytes in byte mode.
    pub target: i64,
    pub rel: i64,
    pub by_bytes: bool,
}

/// State shared between the orchestrator, the reader, the decode workers
/// and the audio callback.
pub(crate) struct Shared {
    pub opts: PlayerOptions,
    pub opener: Arc<dyn MediaOpener>,
    pub audio_sink: Arc<dyn AudioSink>,

    pub audioq: Arc<PacketQueue>,
    pub videoq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,
    pub sampq: Arc<FrameQueue>,
    pub pictq: Arc<FrameQueue>,
    pub subpq: Arc<FrameQueue>,

    pub sync: Arc<SyncState>,
    pub audio_pump: Arc<AudioPump>,
    pub continue_read: Arc<ReadSignal>,

    pub abort: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    pub force_refresh: Arc<AtomicBool>,
    pub realtime: Arc<AtomicBool>,
    pub eof: AtomicBool,
    pub queue_attachments: AtomicBool,
    pub seek: Mutex<Option<SeekRequest>>,
    /// Last requested time-domain seek target, µs; seeds relative seeks
    /// while the clocks are still invalid.
    pub seek_pos: AtomicI64,
    pub seek_by_bytes_auto: AtomicBool,
    pub bit_rate: AtomicI64,
    pub last_read_pos: AtomicI64,

    pub volume: Arc<AtomicI32>,
    pub muted: Arc<AtomicBool>,

    pub loops: AtomicUsize,
    pub workers: Mutex<Vec<JoinHandle<()>>>,
    end: Mutex<Option<SessionEnd>>,
    done: AtomicBool,
}

impl Shared {
    pub(crate) fn finish(&self, end: SessionEnd) {
        *self.end.lock() = Some(end);
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn request_seek(&self, target: i64, rel: i64, by_bytes: bool) {
        let mut pending = self.seek.lock();
        if pending.is_none() {
            *pending = Some(SeekRequest {
                target,
                rel,
                by_bytes,
            });
            if !by_bytes {
                self.seek_pos.store(target, Ordering::Release);
            }
            self.continue_read.notify();
        }
    }
}

/// A running playback session.
///
/// `open` spawns the reader (which opens the input and brings up the decode
/// workers); `run` is the main event/refresh loop and returns when playback
/// ends or a quit command arrives.
pub struct Session {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    renderer: VideoRenderer,
    reader: Option<JoinHandle<()>>,
    commands: Receiver<Command>,
    commands_live: bool,
}

impl Session {
    pub fn open(
        opts: PlayerOptions,
        opener: Arc<dyn MediaOpener>,
        audio_sink: Arc<dyn AudioSink>,
        video_sink: Arc<dyn VideoSink>,
    ) -> Result<(Self, Sender<Command>)> {
        let audioq = Arc::new(PacketQueue::new());
        let videoq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let sampq = Arc::new(FrameQueue::new(SAMPLE_QUEUE_SIZE, true, audioq.abort_flag()));
        let pictq = Arc::new(FrameQueue::new(
            VIDEO_PICTURE_QUEUE_SIZE,
            true,
            videoq.abort_flag(),
        ));
        let subpq = Arc::new(FrameQueue::new(
            SUBPICTURE_QUEUE_SIZE,
            false,
            subtitleq.abort_flag(),
        ));

        let sync = Arc::new(SyncState::new(
            opts.sync,
            opts.framedrop,
            audioq.serial_cell(),
            videoq.serial_cell(),
        ));

        let volume = Arc::new(AtomicI32::new(
            opts.volume.clamp(0, 100) * MIX_MAX_VOLUME / 100,
        ));
        let muted = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let force_refresh = Arc::new(AtomicBool::new(false));
        let realtime = Arc::new(AtomicBool::new(false));

        let audio_pump = AudioPump::new(
            Arc::clone(&sampq),
            audioq.serial_cell(),
            Arc::clone(&sync),
            Arc::clone(&volume),
            Arc::clone(&muted),
            Arc::clone(&paused),
        );

        let shared = Arc::new(Shared {
            opts,
            opener,
            audio_sink,
            audioq: Arc::clone(&audioq),
            videoq: Arc::clone(&videoq),
            subtitleq: Arc::clone(&subtitleq),
            sampq: Arc::clone(&sampq),
            pictq: Arc::clone(&pictq),
            subpq: Arc::clone(&subpq),
            sync: Arc::clone(&sync),
            audio_pump,
            continue_read: Arc::new(ReadSignal::new()),
            abort: Arc::new(AtomicBool::new(false)),
            paused: Arc::clone(&paused),
            force_refresh: Arc::clone(&force_refresh),
            realtime: Arc::clone(&realtime),
            eof: AtomicBool::new(false),
            queue_attachments: AtomicBool::new(false),
            seek: Mutex::new(None),
            seek_pos: AtomicI64::new(0),
            seek_by_bytes_auto: AtomicBool::new(false),
            bit_rate: AtomicI64::new(0),
            last_read_pos: AtomicI64::new(-1),
            volume,
            muted,
            loops: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            end: Mutex::new(None),
            done: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("reader".into())
            .spawn(move || reader::read_loop(reader_shared))
            .map_err(|e| PlayerError::init(e.to_string()))?;

        let scheduler = Scheduler::new(
            pictq,
            subpq,
            videoq,
            subtitleq,
            audioq,
            sync,
            paused,
            force_refresh,
            realtime,
        );
        let renderer = VideoRenderer::new(video_sink);

        let (tx, rx) = unbounded();
        Ok((
            Self {
                shared,
                scheduler,
                renderer,
                reader: Some(reader),
                commands: rx,
                commands_live: true,
            },
            tx,
        ))
    }

    /// Handle to the shared state, for frontends and tests.
    pub fn observer(&self) -> PlayerObserver {
        PlayerObserver {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Event/refresh loop. Blocks the calling thread until the session
    /// ends; tears everything down before returning.
    pub fn run(&mut self) -> ExitReason {
        let mut remaining = 0.0;
        let mut reason = loop {
            if self.shared.done() {
                let end = self.shared.end.lock().take();
                break match end {
                    Some(SessionEnd::Eof) | None => ExitReason::Eof,
                    Some(SessionEnd::Error(err)) => {
                        warn!(%err, "session ended with error");
                        match err {
                            // Bring-up failures, including an exhausted
                            // audio fallback ladder, are fatal.
                            PlayerError::FatalInit(_) | PlayerError::BackendRefusal(_) => {
                                ExitReason::Error
                            }
                            _ => ExitReason::Quit,
                        }
                    }
                };
            }

            // Sleep until the scheduler wants to run again, waking early
            // for commands.
            if self.commands_live {
                match self
                    .commands
                    .recv_timeout(Duration::from_secs_f64(remaining))
                {
                    Ok(Command::Quit) => break ExitReason::Quit,
                    Ok(command) => {
                        self.handle_command(command);
                        remaining = 0.0;
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        self.commands_live = false;
                    }
                }
            } else if remaining > 0.0 {
                thread::sleep(Duration::from_secs_f64(remaining));
            }

            remaining = REFRESH_RATE;
            if !self.shared.paused.load(Ordering::Acquire)
                || self.shared.force_refresh.load(Ordering::Acquire)
            {
                self.scheduler.refresh(&mut self.renderer, &mut remaining);
            }
        };

        if let Err(err) = self.close() {
            warn!(%err, "teardown failed");
            reason = ExitReason::Error;
        }
        reason
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::TogglePause => self.toggle_pause(),
            Command::ToggleMute => {
                let muted = !self.shared.muted.load(Ordering::Acquire);
                self.shared.muted.store(muted, Ordering::Release);
                info!(muted, "mute toggled");
            }
            Command::VolumeUp => self.update_volume(1),
            Command::VolumeDown => self.update_volume(-1),
            Command::SeekBy(secs) => self.seek_relative(secs),
            Command::SeekTo(secs) => {
                self.shared
                    .request_seek((secs * TIME_BASE_MICROS as f64) as i64, 0, false);
            }
            Command::Resize(width, height) => {
                debug!(width, height, "output resized");
                self.renderer.invalidate();
                self.shared.force_refresh.store(true, Ordering::Release);
            }
            Command::Quit => unreachable!("handled by run"),
        }
    }

    fn toggle_pause(&mut self) {
        let shared = &self.shared;
        let was_paused = shared.paused.load(Ordering::Acquire);
        if was_paused {
            self.scheduler.on_unpause(now_seconds());
            shared.sync.vidclk.set_paused(false);
            shared
                .sync
                .vidclk
                .set(shared.sync.vidclk.get(), shared.sync.vidclk.serial());
        }
        shared
            .sync
            .extclk
            .set(shared.sync.extclk.get(), shared.sync.extclk.serial());

        let now_paused = !was_paused;
        shared.paused.store(now_paused, Ordering::Release);
        shared.sync.audclk.set_paused(now_paused);
        shared.sync.vidclk.set_paused(now_paused);
        shared.sync.extclk.set_paused(now_paused);
        shared.force_refresh.store(true, Ordering::Release);
        info!(paused = now_paused, "pause toggled");
    }

    fn update_volume(&self, sign: i32) {
        let shared = &self.shared;
        let volume =
            (shared.volume.load(Ordering::Acquire) + sign * VOLUME_STEP).clamp(0, MIX_MAX_VOLUME);
        shared.volume.store(volume, Ordering::Release);
        info!(volume, "volume changed");
    }

    fn seek_relative(&self, incr: f64) {
        let shared = &self.shared;
        let by_bytes = shared.opts.seek_by_bytes == 1
            || (shared.opts.seek_by_bytes < 0 && shared.seek_by_bytes_auto.load(Ordering::Acquire));

        if by_bytes {
            let pos = shared
                .pictq
                .last_pos(shared.videoq.serial())
                .or_else(|| shared.sampq.last_pos(shared.audioq.serial()))
                .unwrap_or_else(|| shared.last_read_pos.load(Ordering::Acquire));
            let rate = shared.bit_rate.load(Ordering::Acquire);
            let bytes_per_sec = if rate > 0 {
                rate as f64 / 8.0
            } else {
                FALLBACK_BYTES_PER_SEC
            };
            let delta = (incr * bytes_per_sec) as i64;
            shared.request_seek(pos.max(0) + delta, delta, true);
        } else {
            let mut pos = shared.sync.master_clock();
            if pos.is_nan() {
                pos = shared.seek_pos.load(Ordering::Acquire) as f64 / TIME_BASE_MICROS as f64;
            }
            pos += incr;
            let target = (pos * TIME_BASE_MICROS as f64) as i64;
            let rel = (incr * TIME_BASE_MICROS as f64) as i64;
            shared.request_seek(target.max(0), rel, false);
        }
    }

    /// Abort every queue, join every thread, close the sinks.
    pub fn close(&mut self) -> Result<()> {
        let shared = &self.shared;
        shared.abort.store(true, Ordering::Release);
        shared.audioq.abort();
        shared.videoq.abort();
        shared.subtitleq.abort();
        shared.sampq.signal();
        shared.pictq.signal();
        shared.subpq.signal();
        shared.continue_read.notify();

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        for worker in shared.workers.lock().drain(..) {
            let _ = worker.join();
        }
        shared.audio_sink.close();
        debug!("session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Read-only window into a running session.
#[derive(Clone)]
pub struct PlayerObserver {
    shared: Arc<Shared>,
}

impl PlayerObserver {
    pub fn audio_clock(&self) -> f64 {
        self.shared.sync.audclk.get()
    }

    pub fn video_clock(&self) -> f64 {
        self.shared.sync.vidclk.get()
    }

    pub fn master_clock(&self) -> f64 {
        self.shared.sync.master_clock()
    }

    pub fn frame_drops_early(&self) -> usize {
        self.shared.sync.frame_drops_early.load(Ordering::Relaxed)
    }

    pub fn frame_drops_late(&self) -> usize {
        self.shared.sync.frame_drops_late.load(Ordering::Relaxed)
    }

    pub fn frames_duplicated(&self) -> usize {
        self.shared.sync.frame_dups.load(Ordering::Relaxed)
    }

    pub fn audio_queue_serial(&self) -> i32 {
        self.shared.audioq.serial()
    }

    pub fn video_queue_serial(&self) -> i32 {
        self.shared.videoq.serial()
    }

    pub fn subtitle_queue_serial(&self) -> i32 {
        self.shared.subtitleq.serial()
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.audioq.size() + self.shared.videoq.size() + self.shared.subtitleq.size()
    }

    pub fn video_packets(&self) -> usize {
        self.shared.videoq.nb_packets()
    }

    pub fn audio_frame_serials(&self) -> Vec<i32> {
        self.shared.sampq.serials()
    }

    pub fn video_frame_serials(&self) -> Vec<i32> {
        self.shared.pictq.serials()
    }

    pub fn subtitle_frame_serials(&self) -> Vec<i32> {
        self.shared.subpq.serials()
    }

    pub fn audio_frames_remaining(&self) -> usize {
        self.shared.sampq.nb_remaining()
    }

    pub fn video_frames_remaining(&self) -> usize {
        self.shared.pictq.nb_remaining()
    }

    pub fn at_eof(&self) -> bool {
        self.shared.eof.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.shared.done()
    }

    pub fn loops_performed(&self) -> usize {
        self.shared.loops.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> i32 {
        self.shared.volume.load(Ordering::Acquire)
    }

    /// The audio pump, so headless frontends and tests can drive the
    /// callback themselves.
    pub fn pump(&self) -> Arc<AudioPump> {
        Arc::clone(&self.shared.audio_pump)
    }
}
