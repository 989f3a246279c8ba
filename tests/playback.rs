//! End-to-end scenarios over the synthetic backend: a real reader thread,
//! real decode workers, the presentation loop and a hand-driven audio
//! callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use vidplay::audio::{AudioPump, NullAudioSink};
use vidplay::media::synth::SynthOpener;
use vidplay::media::{
    DecodePoll, Demuxer, MediaError, MediaOpener, MediaOptions, Packet, SendStatus, StreamDecoder,
    StreamInfo, StreamKind,
};
use vidplay::options::{PlayerOptions, SyncMode};
use vidplay::session::{Command, ExitReason, PlayerObserver, Session};
use vidplay::video::NullVideoSink;

fn options(input: &str) -> PlayerOptions {
    PlayerOptions {
        input: input.to_string(),
        ..PlayerOptions::default()
    }
}

fn open(opts: PlayerOptions) -> (Session, crossbeam_channel::Sender<Command>) {
    open_with(opts, Arc::new(SynthOpener))
}

fn open_with(
    opts: PlayerOptions,
    opener: Arc<dyn MediaOpener>,
) -> (Session, crossbeam_channel::Sender<Command>) {
    Session::open(
        opts,
        opener,
        Arc::new(NullAudioSink::new()),
        Arc::new(NullVideoSink::new(640, 480)),
    )
    .expect("session opens")
}

/// Synth backend with every audio packet hand-off slowed down, the way a
/// struggling decoder starves the audio side.
struct StarvedAudioOpener {
    delay: Duration,
}

impl MediaOpener for StarvedAudioOpener {
    fn open(
        &self,
        url: &str,
        opts: &MediaOptions,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Box<dyn Demuxer>, MediaError> {
        SynthOpener.open(url, opts, interrupt)
    }

    fn new_decoder(
        &self,
        stream: &StreamInfo,
        opts: &MediaOptions,
    ) -> Result<Box<dyn StreamDecoder>, MediaError> {
        let inner = SynthOpener.new_decoder(stream, opts)?;
        if stream.kind == StreamKind::Audio {
            Ok(Box::new(SlowDecoder {
                inner,
                delay: self.delay,
            }))
        } else {
            Ok(inner)
        }
    }
}

struct SlowDecoder {
    inner: Box<dyn StreamDecoder>,
    delay: Duration,
}

impl StreamDecoder for SlowDecoder {
    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, MediaError> {
        thread::sleep(self.delay);
        self.inner.send(packet)
    }

    fn receive(&mut self) -> Result<DecodePoll, MediaError> {
        self.inner.receive()
    }

    fn reset(&mut self) {
        self.inner.reset()
    }
}

/// Stand-in for the audio device thread: pull S16 from the pump at roughly
/// the pace a real 48 kHz stereo device would.
fn drive_pump(pump: Arc<AudioPump>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; 1024 * 4];
        while !stop.load(Ordering::Acquire) {
            pump.fill(&mut buf);
            thread::sleep(Duration::from_millis(18));
        }
    })
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

struct RunningSession {
    observer: PlayerObserver,
    commands: crossbeam_channel::Sender<Command>,
    handle: JoinHandle<ExitReason>,
    stop_pump: Arc<AtomicBool>,
    pump_handle: JoinHandle<()>,
}

impl RunningSession {
    fn start(opts: PlayerOptions) -> Self {
        Self::start_with(opts, Arc::new(SynthOpener))
    }

    fn start_with(opts: PlayerOptions, opener: Arc<dyn MediaOpener>) -> Self {
        let (mut session, commands) = open_with(opts, opener);
        let observer = session.observer();

        let stop_pump = Arc::new(AtomicBool::new(false));
        let pump_handle = drive_pump(observer.pump(), Arc::clone(&stop_pump));

        let handle = thread::spawn(move || session.run());
        Self {
            observer,
            commands,
            handle,
            stop_pump,
            pump_handle,
        }
    }

    fn finish(self) -> ExitReason {
        let _ = self.commands.send(Command::Quit);
        let reason = self.handle.join().expect("session thread");
        self.stop_pump.store(true, Ordering::Release);
        let _ = self.pump_handle.join();
        reason
    }

    /// Join a session expected to end on its own.
    fn join(self) -> ExitReason {
        let reason = self.handle.join().expect("session thread");
        self.stop_pump.store(true, Ordering::Release);
        let _ = self.pump_handle.join();
        reason
    }
}

#[test]
fn basic_playback_keeps_clocks_together() {
    let mut opts = options("synth:dur=1,fps=30,rate=48000,ch=2");
    opts.autoexit = true;

    let started = Instant::now();
    let run = RunningSession::start(opts);
    let observer = run.observer.clone();

    // Mid-flight, both clocks must be live and near each other.
    assert!(wait_until(Duration::from_secs(5), || {
        let a = observer.audio_clock();
        let v = observer.video_clock();
        !a.is_nan() && !v.is_nan() && (a - v).abs() < 0.25
    }));

    let reason = run.join();
    let elapsed = started.elapsed();

    assert_eq!(reason, ExitReason::Eof);
    // The pump is paced in real time, so a 1 s clip takes about 1 s.
    assert!(elapsed >= Duration::from_millis(600), "finished too fast");
    assert!(elapsed < Duration::from_secs(10), "took far too long");
    assert!(
        observer.frame_drops_early() + observer.frame_drops_late() <= 10,
        "dropped too many frames: {} early, {} late",
        observer.frame_drops_early(),
        observer.frame_drops_late()
    );
}

#[test]
fn forward_seek_discards_stale_frames() {
    let opts = options("synth:dur=30,fps=30,rate=48000,subs=1");
    let run = RunningSession::start(opts);
    let observer = run.observer.clone();

    // Let the first epoch fill the queues.
    assert!(wait_until(Duration::from_secs(5), || {
        !observer.video_frame_serials().is_empty()
            && !observer.audio_frame_serials().is_empty()
    }));
    let before = observer.video_queue_serial();

    run.commands.send(Command::SeekTo(10.0)).unwrap();

    // Every frame still addressable must soon carry the post-seek serial.
    let after = before + 1;
    assert!(
        wait_until(Duration::from_secs(5), || {
            observer.video_queue_serial() == after
                && observer
                    .video_frame_serials()
                    .iter()
                    .all(|&s| s == after)
                && observer
                    .audio_frame_serials()
                    .iter()
                    .all(|&s| s == after)
                && observer
                    .subtitle_frame_serials()
                    .iter()
                    .all(|&s| s == after)
                && !observer.video_frame_serials().is_empty()
        }),
        "stale frames survived the seek"
    );

    // And the clocks resume in the neighborhood of the target.
    assert!(wait_until(Duration::from_secs(5), || {
        let v = observer.video_clock();
        !v.is_nan() && v > 9.0
    }));

    assert_eq!(run.finish(), ExitReason::Quit);
}

#[test]
fn video_master_starvation_engages_the_audio_clamp() {
    let mut opts = options("synth:dur=1,fps=30,rate=48000,ch=2");
    opts.sync = SyncMode::Video;
    opts.autoexit = true;

    let run = RunningSession::start_with(
        opts,
        Arc::new(StarvedAudioOpener {
            delay: Duration::from_millis(25),
        }),
    );
    let observer = run.observer.clone();

    let reason = run.join();
    assert_eq!(reason, ExitReason::Eof);

    // Audio lagged the video master, so rate matching had to kick in, and
    // every per-frame adjustment stayed inside the ten percent clamp.
    let pump = observer.pump();
    assert!(pump.compensation_engaged(), "compensation never engaged");
    assert!(
        pump.max_compensation_per_mille() <= 100,
        "clamp exceeded: {} per mille",
        pump.max_compensation_per_mille()
    );

    // The master never waits for a slave: no video frame was duplicated.
    assert_eq!(observer.frames_duplicated(), 0);
}

#[test]
fn relative_seek_jumps_the_master_clock() {
    let opts = options("synth:dur=60,fps=30,rate=48000");
    let run = RunningSession::start(opts);
    let observer = run.observer.clone();

    assert!(wait_until(Duration::from_secs(5), || {
        !observer.master_clock().is_nan()
    }));

    run.commands
        .send(Command::SeekBy(vidplay::session::SEEK_STEP_SECS))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        let m = observer.master_clock();
        !m.is_nan() && m > 8.0
    }));

    assert_eq!(run.finish(), ExitReason::Quit);
}

#[test]
fn loop_playback_rewinds_then_exits() {
    let mut opts = options("synth:dur=0.4,video=0,rate=48000");
    opts.loop_count = 3;
    opts.autoexit = true;

    let run = RunningSession::start(opts);
    let observer = run.observer.clone();

    let reason = run.join();
    assert_eq!(reason, ExitReason::Eof);
    // Three playthroughs mean two rewind seeks back to the start.
    assert_eq!(observer.loops_performed(), 2);
}

#[test]
fn eof_drains_decoders_and_empties_queues() {
    let mut opts = options("synth:dur=0.5,fps=30,rate=48000");
    opts.autoexit = true;

    let run = RunningSession::start(opts);
    let observer = run.observer.clone();

    let reason = run.join();
    assert_eq!(reason, ExitReason::Eof);
    assert!(observer.at_eof());
    assert_eq!(observer.audio_frames_remaining(), 0);
    assert_eq!(observer.video_frames_remaining(), 0);
}

#[test]
fn reader_backpressure_bounds_queued_bytes() {
    // Big video packets, nobody consuming: the reader must stop at the
    // queue ceiling instead of slurping the whole stream.
    let opts = options("synth:dur=600,fps=30,vbytes=262144,audio=0");
    let (session, _commands) = open(opts);
    let observer = session.observer();

    const CEILING: usize = vidplay::session::MAX_QUEUE_SIZE + 512 * 1024;

    assert!(wait_until(Duration::from_secs(10), || {
        observer.queued_bytes() > vidplay::session::MAX_QUEUE_SIZE / 2
    }));

    // Stabilized and bounded.
    thread::sleep(Duration::from_millis(300));
    let first = observer.queued_bytes();
    assert!(first <= CEILING, "queued {first} bytes, ceiling {CEILING}");
    thread::sleep(Duration::from_millis(300));
    let second = observer.queued_bytes();
    assert!(second <= CEILING);
    assert!(
        first.abs_diff(second) < 1024 * 1024,
        "queue size still moving: {first} -> {second}"
    );

    drop(session);
}

#[test]
fn volume_commands_step_and_clamp() {
    let opts = options("synth:dur=30,video=0");
    let run = RunningSession::start(opts);
    let observer = run.observer.clone();

    let initial = observer.volume();
    for _ in 0..200 {
        run.commands.send(Command::VolumeUp).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        observer.volume() == vidplay::audio::MIX_MAX_VOLUME
    }));

    for _ in 0..400 {
        run.commands.send(Command::VolumeDown).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || observer.volume() == 0));
    assert!(initial > 0);

    assert_eq!(run.finish(), ExitReason::Quit);
}
