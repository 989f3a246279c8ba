use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audio::{AudioParams, audio_open};
use crate::decode::{Decoder, PacketQueue, audio_worker, subtitle_worker, video_worker};
use crate::error::PlayerError;
use crate::media::{
    Packet, SeekTarget, StreamInfo, StreamKind, StreamParams, TIME_BASE_MICROS,
};
use crate::playback::frame_queue::FrameQueue;

use super::{SessionEnd, Shared};

/// Total queued bytes across all packet queues before the reader sleeps.
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// Per-stream packet count past which a stream counts as well-fed.
pub const MIN_FRAMES: usize = 25;

/// Microsecond slack applied around seek targets; some demuxers round the
/// target in the wrong direction without it.
pub const SEEK_WINDOW_FUDGE: i64 = 2;

/// A stream the reader opened, with everything needed to feed and drain it.
struct ActiveStream {
    info: StreamInfo,
    queue: Arc<PacketQueue>,
    frames: Arc<FrameQueue>,
    finished: Arc<crate::clock::SerialCell>,
}

impl ActiveStream {
    /// A stream is played out when its decoder drained the current epoch
    /// and the consumer emptied the frame queue.
    fn is_done(&self) -> bool {
        self.finished.get() == self.queue.serial() && self.frames.nb_remaining() == 0
    }

    fn has_enough_packets(&self) -> bool {
        self.queue.is_aborted()
            || self.info.is_attached_picture()
            || (self.queue.nb_packets() > MIN_FRAMES
                && (self.queue.duration() == 0
                    || self.queue.duration() as f64 * self.info.time_base.as_f64() > 1.0))
    }
}

/// The demuxer driver thread: open, select streams, spawn decoders, then
/// loop over seek handling, backpressure, EOF and packet dispatch.
pub(super) fn read_loop(shared: Arc<Shared>) {
    let media_opts = shared.opts.media_options();
    let mut demuxer = match shared.opener.open(
        &shared.opts.input,
        &media_opts,
        Arc::clone(&shared.abort),
    ) {
        Ok(demuxer) => demuxer,
        Err(err) => {
            shared.finish(SessionEnd::Error(PlayerError::FatalInit(format!(
                "cannot open {}: {err}",
                shared.opts.input
            ))));
            return;
        }
    };

    let realtime = demuxer.is_realtime();
    shared.realtime.store(realtime, Ordering::Release);
    shared
        .seek_by_bytes_auto
        .store(demuxer.reports_discontinuities(), Ordering::Release);
    shared.sync.set_max_frame_duration(if demuxer.reports_discontinuities() {
        10.0
    } else {
        3600.0
    });
    if let Some(rate) = demuxer.bit_rate() {
        shared.bit_rate.store(rate, Ordering::Release);
    }

    if let Some(start) = shared.opts.start_time {
        let target = start + demuxer.start_time().unwrap_or(0);
        let initial = SeekTarget {
            min: i64::MIN,
            target,
            max: i64::MAX,
            by_bytes: false,
        };
        if let Err(err) = demuxer.seek(&initial) {
            warn!(%err, target, "could not seek to requested start");
        }
    }

    let streams = demuxer.streams().to_vec();
    let audio = (!shared.opts.disable_audio)
        .then(|| streams.iter().find(|s| s.kind == StreamKind::Audio))
        .flatten();
    let video = (!shared.opts.disable_video)
        .then(|| {
            streams
                .iter()
                .find(|s| s.kind == StreamKind::Video && !s.is_attached_picture())
                .or_else(|| streams.iter().find(|s| s.kind == StreamKind::Video))
        })
        .flatten();
    let subtitle = (!shared.opts.disable_subtitles)
        .then(|| streams.iter().find(|s| s.kind == StreamKind::Subtitle))
        .flatten();

    let audio = audio.and_then(|stream| match open_audio(&shared, stream) {
        Ok(active) => Some(active),
        Err(err) => {
            error!(%err, "cannot open audio stream");
            if matches!(err, PlayerError::BackendRefusal(_)) {
                shared.finish(SessionEnd::Error(err));
            }
            None
        }
    });
    if shared.done() {
        return;
    }
    let video = video.and_then(|stream| match open_video(&shared, stream) {
        Ok(active) => Some(active),
        Err(err) => {
            error!(%err, "cannot open video stream");
            None
        }
    });
    let subtitle = subtitle.and_then(|stream| match open_subtitle(&shared, stream) {
        Ok(active) => Some(active),
        Err(err) => {
            error!(%err, "cannot open subtitle stream");
            None
        }
    });

    if audio.is_none() && video.is_none() {
        shared.finish(SessionEnd::Error(PlayerError::init(
            "no playable streams in input",
        )));
        return;
    }
    info!(
        audio = audio.is_some(),
        video = video.is_some(),
        subtitle = subtitle.is_some(),
        realtime,
        "input opened"
    );

    let mut loop_left = shared.opts.loop_count;

    loop {
        if shared.abort.load(Ordering::Acquire) {
            break;
        }

        // Seek requests from the orchestrator (or the loop handler below).
        let request = shared.seek.lock().take();
        if let Some(req) = request {
            let (min, max) = if req.by_bytes {
                (i64::MIN, i64::MAX)
            } else {
                (
                    if req.rel > 0 {
                        req.target - req.rel + SEEK_WINDOW_FUDGE
                    } else {
                        i64::MIN
                    },
                    if req.rel < 0 {
                        req.target - req.rel - SEEK_WINDOW_FUDGE
                    } else {
                        i64::MAX
                    },
                )
            };
            let target = SeekTarget {
                min,
                target: req.target,
                max,
                by_bytes: req.by_bytes,
            };
            match demuxer.seek(&target) {
                Err(err) => warn!(%err, target = req.target, "seek failed"),
                Ok(()) => {
                    for active in [&audio, &subtitle, &video].into_iter().flatten() {
                        active.queue.flush();
                        active.queue.put_flush();
                    }
                    if req.by_bytes {
                        shared.sync.extclk.set(f64::NAN, 0);
                    } else {
                        shared
                            .sync
                            .extclk
                            .set(req.target as f64 / TIME_BASE_MICROS as f64, 0);
                    }
                    debug!(target = req.target, by_bytes = req.by_bytes, "seek done");
                }
            }
            shared.eof.store(false, Ordering::Release);
            shared.queue_attachments.store(true, Ordering::Release);
            shared.force_refresh.store(true, Ordering::Release);
        }

        if shared.queue_attachments.swap(false, Ordering::AcqRel) {
            if let Some(active) = &video {
                if let StreamParams::Video {
                    attached_picture: Some(picture),
                    ..
                } = &active.info.params
                {
                    let _ = active.queue.put(picture.clone());
                    let _ = active.queue.put(Packet::drain(active.info.index));
                }
            }
        }

        // Backpressure: pause reading while downstream has plenty.
        let infinite = shared.opts.infinite_buffer == 1
            || (shared.opts.infinite_buffer < 0 && realtime);
        if !infinite {
            let total: usize = [&audio, &video, &subtitle]
                .into_iter()
                .flatten()
                .map(|a| a.queue.size())
                .sum();
            let all_fed = [&audio, &video, &subtitle]
                .into_iter()
                .flatten()
                .all(|a| a.has_enough_packets());
            if total > MAX_QUEUE_SIZE || all_fed {
                shared.continue_read.wait_timeout(Duration::from_millis(10));
                continue;
            }
        }

        // Every active stream fully played out: loop, exit, or idle.
        let paused = shared.paused.load(Ordering::Acquire);
        let all_done = !paused
            && audio.as_ref().is_none_or(ActiveStream::is_done)
            && video.as_ref().is_none_or(ActiveStream::is_done);
        if all_done {
            let run_again = loop_left != 1 && {
                if loop_left == 0 {
                    true
                } else {
                    loop_left -= 1;
                    loop_left != 0
                }
            };
            if run_again {
                shared.loops.fetch_add(1, Ordering::Relaxed);
                let target = shared.opts.start_time.unwrap_or(0);
                shared.request_seek(target, 0, false);
                continue;
            } else if shared.opts.autoexit {
                shared.finish(SessionEnd::Eof);
                break;
            }
        }

        let packet = match demuxer.read_packet() {
            Ok(Some(packet)) => {
                shared.eof.store(false, Ordering::Release);
                packet
            }
            Ok(None) => {
                if !shared.eof.swap(true, Ordering::AcqRel) {
                    // Drain markers push the decoders to their last frames.
                    for active in [&video, &audio, &subtitle].into_iter().flatten() {
                        let _ = active.queue.put(Packet::drain(active.info.index));
                    }
                    debug!("demuxer end of stream");
                }
                shared.continue_read.wait_timeout(Duration::from_millis(10));
                continue;
            }
            Err(err) => {
                error!(%err, "read failed, stopping playback");
                shared.finish(SessionEnd::Error(PlayerError::Io(err)));
                break;
            }
        };

        shared
            .last_read_pos
            .store(packet.pos, Ordering::Release);

        let stream = &streams[packet.stream_index];
        let in_range = shared.opts.play_duration.is_none_or(|duration| {
            let Some(ts) = packet.ts() else { return true };
            let stream_start = stream.start_time.unwrap_or(0);
            let elapsed = (ts - stream_start) as f64 * stream.time_base.as_f64()
                - shared.opts.start_time.unwrap_or(0) as f64 / TIME_BASE_MICROS as f64;
            elapsed <= duration as f64 / TIME_BASE_MICROS as f64
        });
        if !in_range {
            continue;
        }

        let target = match stream.kind {
            StreamKind::Audio => audio.as_ref(),
            StreamKind::Video => video
                .as_ref()
                .filter(|active| !active.info.is_attached_picture()),
            StreamKind::Subtitle => subtitle.as_ref(),
        };
        if let Some(active) = target.filter(|a| a.info.index == packet.stream_index) {
            let _ = active.queue.put(packet);
        }
    }

    debug!("reader exiting");
}

fn open_audio(shared: &Arc<Shared>, stream: &StreamInfo) -> Result<ActiveStream, PlayerError> {
    let StreamParams::Audio {
        sample_rate,
        channels,
    } = stream.params
    else {
        return Err(PlayerError::init("not an audio stream"));
    };

    let codec = shared
        .opener
        .new_decoder(stream, &shared.opts.media_options())
        .map_err(|e| PlayerError::init(format!("audio decoder: {e}")))?;

    let wanted = AudioParams {
        freq: sample_rate,
        channels,
    };
    let open = audio_open(
        shared.audio_sink.as_ref(),
        wanted,
        Arc::clone(&shared.audio_pump),
    )?;
    info!(
        freq = open.params.freq,
        channels = open.params.channels,
        buffer = open.buffer_bytes,
        "audio device opened"
    );
    shared.audio_pump.configure(open.params, open.buffer_bytes);

    shared.audioq.start();
    let mut dec = Decoder::new(
        codec,
        Arc::clone(&shared.audioq),
        Arc::clone(&shared.continue_read),
    );
    dec.set_start_pts(stream.start_time, stream.time_base);
    let finished = dec.finished_cell();

    let frames = Arc::clone(&shared.sampq);
    let worker_stream = stream.clone();
    let handle = thread::Builder::new()
        .name("audio-dec".into())
        .spawn(move || audio_worker(dec, frames, worker_stream))
        .map_err(|e| PlayerError::init(e.to_string()))?;
    shared.workers.lock().push(handle);

    shared.sync.set_has_audio(true);
    shared.audio_sink.pause(false);

    Ok(ActiveStream {
        info: stream.clone(),
        queue: Arc::clone(&shared.audioq),
        frames: Arc::clone(&shared.sampq),
        finished,
    })
}

fn open_video(shared: &Arc<Shared>, stream: &StreamInfo) -> Result<ActiveStream, PlayerError> {
    let codec = shared
        .opener
        .new_decoder(stream, &shared.opts.media_options())
        .map_err(|e| PlayerError::init(format!("video decoder: {e}")))?;

    shared.videoq.start();
    let dec = Decoder::new(
        codec,
        Arc::clone(&shared.videoq),
        Arc::clone(&shared.continue_read),
    );
    let finished = dec.finished_cell();

    let frames = Arc::clone(&shared.pictq);
    let sync = Arc::clone(&shared.sync);
    let worker_stream = stream.clone();
    let reorder = shared.opts.decoder_reorder_pts;
    let handle = thread::Builder::new()
        .name("video-dec".into())
        .spawn(move || video_worker(dec, frames, sync, worker_stream, reorder))
        .map_err(|e| PlayerError::init(e.to_string()))?;
    shared.workers.lock().push(handle);

    shared.sync.set_has_video(true);
    shared.queue_attachments.store(true, Ordering::Release);

    Ok(ActiveStream {
        info: stream.clone(),
        queue: Arc::clone(&shared.videoq),
        frames: Arc::clone(&shared.pictq),
        finished,
    })
}

fn open_subtitle(shared: &Arc<Shared>, stream: &StreamInfo) -> Result<ActiveStream, PlayerError> {
    let codec = shared
        .opener
        .new_decoder(stream, &shared.opts.media_options())
        .map_err(|e| PlayerError::init(format!("subtitle decoder: {e}")))?;

    shared.subtitleq.start();
    let dec = Decoder::new(
        codec,
        Arc::clone(&shared.subtitleq),
        Arc::clone(&shared.continue_read),
    );
    let finished = dec.finished_cell();

    let frames = Arc::clone(&shared.subpq);
    let handle = thread::Builder::new()
        .name("subtitle-dec".into())
        .spawn(move || subtitle_worker(dec, frames))
        .map_err(|e| PlayerError::init(e.to_string()))?;
    shared.workers.lock().push(handle);

    Ok(ActiveStream {
        info: stream.clone(),
        queue: Arc::clone(&shared.subtitleq),
        frames: Arc::clone(&shared.subpq),
        finished,
    })
}
