use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{NOSYNC_THRESHOLD, SerialCell};
use crate::media::{
    DecodePoll, DecodedFrame, Packet, SendStatus, StreamDecoder, StreamInfo, StreamParams,
    TimeBase,
};
use crate::playback::frame::Frame;
use crate::playback::frame_queue::FrameQueue;
use crate::playback::sync::SyncState;

use super::ReadSignal;
use super::packet_queue::{PacketGet, PacketItem, PacketQueue};

/// Per-stream decode driver: pulls serial-tagged packets from the queue,
/// feeds the codec, and tracks the drain watermark.
pub struct Decoder {
    codec: Box<dyn StreamDecoder>,
    queue: Arc<PacketQueue>,
    pkt_serial: i32,
    /// Serial at which this decoder ran dry; 0 while still producing.
    finished: Arc<SerialCell>,
    /// Packet the codec refused while full, retried after draining output.
    pending: Option<Packet>,
    start_pts: Option<i64>,
    start_pts_tb: TimeBase,
    next_pts: Option<i64>,
    next_pts_tb: TimeBase,
    empty_queue_signal: Arc<ReadSignal>,
}

impl Decoder {
    pub fn new(
        codec: Box<dyn StreamDecoder>,
        queue: Arc<PacketQueue>,
        empty_queue_signal: Arc<ReadSignal>,
    ) -> Self {
        Self {
            codec,
            queue,
            pkt_serial: -1,
            finished: SerialCell::new(0),
            pending: None,
            start_pts: None,
            start_pts_tb: TimeBase::new(1, 1),
            next_pts: None,
            next_pts_tb: TimeBase::new(1, 1),
            empty_queue_signal,
        }
    }

    /// For streams with packet-implicit timing: where pts continuation
    /// restarts after each flush.
    pub fn set_start_pts(&mut self, pts: Option<i64>, tb: TimeBase) {
        self.start_pts = pts;
        self.start_pts_tb = tb;
    }

    pub fn pkt_serial(&self) -> i32 {
        self.pkt_serial
    }

    pub fn finished_cell(&self) -> Arc<SerialCell> {
        Arc::clone(&self.finished)
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    /// Produce the next decoded frame.
    ///
    /// `Ok(None)` means the codec drained at the current serial; the next
    /// call blocks for a fresh packet or flush barrier. `Err(())` is abort.
    pub fn decode_next(&mut self) -> Result<Option<DecodedFrame>, ()> {
        loop {
            // Drain the codec while its output belongs to the live epoch.
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return Err(());
                    }
                    match self.codec.receive() {
                        Ok(DecodePoll::Frame(frame)) => return Ok(Some(frame)),
                        Ok(DecodePoll::Pending) => break,
                        Ok(DecodePoll::Drained) => {
                            self.finished.set(self.pkt_serial);
                            self.codec.reset();
                            return Ok(None);
                        }
                        Err(err) => {
                            warn!(%err, "decoder receive failed, skipping");
                            break;
                        }
                    }
                }
            }

            // Fetch a packet from the live epoch.
            let packet = loop {
                if self.queue.nb_packets() == 0 {
                    self.empty_queue_signal.notify();
                }
                let item = match self.pending.take() {
                    Some(packet) => PacketItem::Packet {
                        packet,
                        serial: self.pkt_serial,
                    },
                    None => match self.queue.get(true) {
                        PacketGet::Item(item) => item,
                        PacketGet::Aborted => return Err(()),
                        PacketGet::Empty => unreachable!("blocking get never returns empty"),
                    },
                };
                match item {
                    PacketItem::Flush { serial } => {
                        debug!(serial, "decoder flush");
                        self.codec.reset();
                        self.finished.set(0);
                        self.pkt_serial = serial;
                        self.next_pts = self.start_pts;
                        self.next_pts_tb = self.start_pts_tb;
                    }
                    PacketItem::Packet { packet, serial } => {
                        self.pkt_serial = serial;
                        if serial == self.queue.serial() {
                            break packet;
                        }
                        // Stale packet from before the last seek.
                    }
                }
            };

            if packet.is_drain() {
                if let Err(err) = self.codec.send(None) {
                    warn!(%err, "decoder drain request failed");
                }
            } else {
                match self.codec.send(Some(&packet)) {
                    Ok(SendStatus::Accepted) => {}
                    Ok(SendStatus::Full) => {
                        // Codec wants its output drained first; retry the
                        // same packet after the next receive pass.
                        self.pending = Some(packet);
                    }
                    Err(err) => {
                        warn!(%err, "packet failed to decode, dropping");
                    }
                }
            }
        }
    }
}

/// Audio decode loop: rescales codec timestamps into sample counts and
/// continues missing timestamps from the previous frame.
pub fn audio_worker(mut dec: Decoder, frames: Arc<FrameQueue>, stream: StreamInfo) {
    let tb = stream.time_base;
    loop {
        match dec.decode_next() {
            Err(()) => break,
            Ok(None) => continue,
            Ok(Some(DecodedFrame::Audio(data))) => {
                let sample_tb = TimeBase::new(1, data.sample_rate as i32);
                let pts_samples = match data.pts {
                    Some(pts) => Some(tb.rescale(pts, sample_tb)),
                    None => dec
                        .next_pts
                        .map(|next| dec.next_pts_tb.rescale(next, sample_tb)),
                };
                if let Some(pts) = pts_samples {
                    dec.next_pts = Some(pts + data.nb_samples() as i64);
                    dec.next_pts_tb = sample_tb;
                }

                let pts = pts_samples
                    .map(|p| p as f64 * sample_tb.as_f64())
                    .unwrap_or(f64::NAN);
                let duration = data.nb_samples() as f64 / data.sample_rate as f64;
                let pos = data.pos;
                let serial = dec.pkt_serial();
                if frames
                    .push(Frame::audio(data, pts, duration, pos, serial))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(_)) => warn!("audio decoder produced a non-audio frame"),
        }
    }
    debug!("audio decode worker exiting");
}

/// Video decode loop, including the early drop of frames that are already
/// late when they leave the codec.
pub fn video_worker(
    mut dec: Decoder,
    frames: Arc<FrameQueue>,
    sync: Arc<SyncState>,
    stream: StreamInfo,
    decoder_reorder_pts: i32,
) {
    let tb = stream.time_base;
    let frame_rate = match stream.params {
        StreamParams::Video { frame_rate, .. } => frame_rate,
        _ => 0.0,
    };
    let frame_duration = if frame_rate > 0.0 { 1.0 / frame_rate } else { 0.0 };

    loop {
        match dec.decode_next() {
            Err(()) => break,
            Ok(None) => continue,
            Ok(Some(DecodedFrame::Video(video))) => {
                let chosen = match decoder_reorder_pts {
                    -1 => video.best_effort_ts,
                    0 => video.pkt_dts,
                    _ => video.pts,
                };
                let pts = chosen.map(|p| p as f64 * tb.as_f64()).unwrap_or(f64::NAN);

                if !pts.is_nan() && sync.drop_frames() {
                    let diff = pts - sync.master_clock();
                    if !diff.is_nan()
                        && diff.abs() < NOSYNC_THRESHOLD
                        && diff < 0.0
                        && dec.pkt_serial() == sync.vidclk.serial()
                        && dec.queue().nb_packets() != 0
                    {
                        sync.frame_drops_early
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        continue;
                    }
                }

                let serial = dec.pkt_serial();
                if frames
                    .push(Frame::video(
                        video.picture,
                        pts,
                        frame_duration,
                        video.pos,
                        serial,
                    ))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(_)) => warn!("video decoder produced a non-video frame"),
        }
    }
    debug!("video decode worker exiting");
}

/// Subtitle decode loop. Timestamps arrive in microseconds.
pub fn subtitle_worker(mut dec: Decoder, frames: Arc<FrameQueue>) {
    loop {
        match dec.decode_next() {
            Err(()) => break,
            Ok(None) => continue,
            Ok(Some(DecodedFrame::Subtitle(sub))) => {
                let pts = sub.pts.map(|p| p as f64 / 1e6).unwrap_or(0.0);
                let serial = dec.pkt_serial();
                if frames.push(Frame::subtitle(sub, pts, serial)).is_err() {
                    break;
                }
            }
            Ok(Some(_)) => warn!("subtitle decoder produced a non-subtitle frame"),
        }
    }
    debug!("subtitle decode worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use std::collections::VecDeque;

    /// Echoes packet payload length as a one-item "frame" per packet and
    /// honors drain semantics.
    struct StubCodec {
        ready: VecDeque<usize>,
        draining: bool,
    }

    impl StubCodec {
        fn new() -> Self {
            Self {
                ready: VecDeque::new(),
                draining: false,
            }
        }
    }

    impl StreamDecoder for StubCodec {
        fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, MediaError> {
            match packet {
                Some(p) => {
                    if !self.ready.is_empty() {
                        return Ok(SendStatus::Full);
                    }
                    self.ready.push_back(p.data.len());
                    Ok(SendStatus::Accepted)
                }
                None => {
                    self.draining = true;
                    Ok(SendStatus::Accepted)
                }
            }
        }

        fn receive(&mut self) -> Result<DecodePoll, MediaError> {
            if let Some(len) = self.ready.pop_front() {
                return Ok(DecodePoll::Frame(DecodedFrame::Subtitle(
                    crate::media::SubtitleData {
                        text: format!("{len}"),
                        pts: Some(0),
                        start_display_ms: 0,
                        end_display_ms: 100,
                    },
                )));
            }
            if self.draining {
                self.draining = false;
                Ok(DecodePoll::Drained)
            } else {
                Ok(DecodePoll::Pending)
            }
        }

        fn reset(&mut self) {
            self.ready.clear();
            self.draining = false;
        }
    }

    fn packet(len: usize) -> Packet {
        Packet {
            stream_index: 0,
            data: Arc::new(vec![0u8; len]),
            pts: Some(0),
            dts: Some(0),
            duration: 1,
            pos: -1,
        }
    }

    fn decoder(queue: &Arc<PacketQueue>) -> Decoder {
        Decoder::new(
            Box::new(StubCodec::new()),
            Arc::clone(queue),
            Arc::new(ReadSignal::new()),
        )
    }

    #[test]
    fn decodes_packets_in_order() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.put(packet(3)).unwrap();
        queue.put(packet(7)).unwrap();

        let mut dec = decoder(&queue);
        for expected in ["3", "7"] {
            match dec.decode_next() {
                Ok(Some(DecodedFrame::Subtitle(s))) => assert_eq!(s.text, expected),
                _ => panic!("expected a decoded frame"),
            }
        }
        assert_eq!(dec.pkt_serial(), 1);
    }

    #[test]
    fn drain_packet_sets_finished_watermark() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.put(packet(1)).unwrap();
        queue.put(Packet::drain(0)).unwrap();

        let mut dec = decoder(&queue);
        let finished = dec.finished_cell();

        assert!(matches!(dec.decode_next(), Ok(Some(_))));
        assert!(matches!(dec.decode_next(), Ok(None)));
        assert_eq!(finished.get(), queue.serial());
    }

    #[test]
    fn stale_packets_are_skipped_after_flush() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.put(packet(1)).unwrap();
        queue.put(packet(2)).unwrap();
        // Seek: everything above predates the new epoch.
        queue.put_flush();
        queue.put(packet(9)).unwrap();

        let mut dec = decoder(&queue);
        match dec.decode_next() {
            Ok(Some(DecodedFrame::Subtitle(s))) => assert_eq!(s.text, "9"),
            _ => panic!("expected the post-flush packet"),
        }
        assert_eq!(dec.pkt_serial(), queue.serial());
    }

    #[test]
    fn flush_resets_finished_watermark() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.put(Packet::drain(0)).unwrap();

        let mut dec = decoder(&queue);
        let finished = dec.finished_cell();
        assert!(matches!(dec.decode_next(), Ok(None)));
        assert_eq!(finished.get(), 1);

        queue.put_flush();
        queue.put(packet(5)).unwrap();
        assert!(matches!(dec.decode_next(), Ok(Some(_))));
        assert_eq!(finished.get(), 0);
    }

    #[test]
    fn abort_exits_decode() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.abort();

        let mut dec = decoder(&queue);
        assert!(dec.decode_next().is_err());
    }
}
