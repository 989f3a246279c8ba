use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use super::frame::Frame;

/// Hard cap on ring capacity.
pub const FRAME_QUEUE_MAX: usize = 16;

pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
pub const SAMPLE_QUEUE_SIZE: usize = 9;

struct RingInner {
    slots: Vec<Option<Frame>>,
    rindex: usize,
    windex: usize,
    size: usize,
    /// 1 once the frame at `rindex` has been shown but kept addressable.
    rindex_shown: usize,
}

/// Bounded ring of decoded frames between one decoder and one consumer.
///
/// With `keep_last`, the most recently shown frame stays addressable as
/// "last" for one extra step, which the presentation scheduler needs to
/// measure the previous frame's real duration.
pub struct FrameQueue {
    inner: Mutex<RingInner>,
    cond: Condvar,
    keep_last: bool,
    max_size: usize,
    /// Shared with the paired packet queue; set on teardown.
    abort: Arc<AtomicBool>,
}

impl FrameQueue {
    pub fn new(max_size: usize, keep_last: bool, abort: Arc<AtomicBool>) -> Self {
        let max_size = max_size.min(FRAME_QUEUE_MAX);
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, || None);
        Self {
            inner: Mutex::new(RingInner {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            keep_last,
            max_size,
            abort,
        }
    }

    /// Wake every waiter; used together with the abort flag on teardown.
    pub fn signal(&self) {
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }

    /// Block until a slot is free, then commit `frame`. Fails on abort.
    pub fn push(&self, frame: Frame) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        while inner.size >= self.max_size && !self.abort.load(Ordering::Acquire) {
            self.cond.wait(&mut inner);
        }
        if self.abort.load(Ordering::Acquire) {
            return Err(());
        }
        let windex = inner.windex;
        inner.slots[windex] = Some(frame);
        inner.windex = (windex + 1) % self.max_size;
        inner.size += 1;
        self.cond.notify_all();
        Ok(())
    }

    /// The next frame to show, without consuming it.
    pub fn peek(&self) -> Option<Frame> {
        let inner = self.inner.lock();
        if inner.size - inner.rindex_shown == 0 {
            return None;
        }
        inner.slots[(inner.rindex + inner.rindex_shown) % self.max_size].clone()
    }

    /// The frame after [`FrameQueue::peek`].
    pub fn peek_next(&self) -> Option<Frame> {
        let inner = self.inner.lock();
        if inner.size - inner.rindex_shown < 2 {
            return None;
        }
        inner.slots[(inner.rindex + inner.rindex_shown + 1) % self.max_size].clone()
    }

    /// The frame currently on screen. Before anything has been shown this is
    /// the same slot [`FrameQueue::peek`] returns.
    pub fn peek_last(&self) -> Option<Frame> {
        let inner = self.inner.lock();
        if inner.size == 0 && inner.rindex_shown == 0 {
            return None;
        }
        inner.slots[inner.rindex].clone()
    }

    /// Block until a frame is readable. Fails on abort.
    pub fn peek_readable(&self) -> Result<Frame, ()> {
        let mut inner = self.inner.lock();
        while inner.size - inner.rindex_shown == 0 && !self.abort.load(Ordering::Acquire) {
            self.cond.wait(&mut inner);
        }
        if self.abort.load(Ordering::Acquire) {
            return Err(());
        }
        Ok(inner.slots[(inner.rindex + inner.rindex_shown) % self.max_size]
            .clone()
            .expect("readable slot is populated"))
    }

    /// Consume the frame at the read position. The first call on a
    /// `keep_last` queue only marks the frame as shown.
    pub fn next(&self) {
        let mut inner = self.inner.lock();
        if self.keep_last && inner.rindex_shown == 0 {
            inner.rindex_shown = 1;
            return;
        }
        let rindex = inner.rindex;
        inner.slots[rindex] = None;
        inner.rindex = (rindex + 1) % self.max_size;
        inner.size -= 1;
        self.cond.notify_all();
    }

    /// Frames available to the consumer.
    pub fn nb_remaining(&self) -> usize {
        let inner = self.inner.lock();
        inner.size - inner.rindex_shown
    }

    /// Whether a frame has been shown from the current read slot.
    pub fn rindex_shown(&self) -> bool {
        self.inner.lock().rindex_shown == 1
    }

    /// Serials of every frame currently held, shown slot included.
    pub fn serials(&self) -> Vec<i32> {
        let inner = self.inner.lock();
        inner.slots.iter().flatten().map(|f| f.serial).collect()
    }

    /// Byte position of the last shown frame, if it belongs to the current
    /// queue epoch. Drives byte-based seeking.
    pub fn last_pos(&self, queue_serial: i32) -> Option<i64> {
        let inner = self.inner.lock();
        if inner.rindex_shown == 0 {
            return None;
        }
        inner.slots[inner.rindex]
            .as_ref()
            .filter(|f| f.serial == queue_serial)
            .map(|f| f.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioData, SubtitleData};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn frame(pts: f64, serial: i32) -> Frame {
        Frame::audio(
            AudioData {
                samples: Arc::new(vec![0.0; 8]),
                channels: 2,
                sample_rate: 48000,
                pts: None,
                pos: -1,
            },
            pts,
            0.1,
            -1,
            serial,
        )
    }

    fn queue(cap: usize, keep_last: bool) -> FrameQueue {
        FrameQueue::new(cap, keep_last, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn fifo_order_and_counts() {
        let q = queue(3, false);
        q.push(frame(0.0, 1)).unwrap();
        q.push(frame(1.0, 1)).unwrap();
        assert_eq!(q.nb_remaining(), 2);

        assert_eq!(q.peek().unwrap().pts, 0.0);
        assert_eq!(q.peek_next().unwrap().pts, 1.0);
        q.next();
        assert_eq!(q.peek().unwrap().pts, 1.0);
        q.next();
        assert_eq!(q.nb_remaining(), 0);
    }

    #[test]
    fn keep_last_defers_release_by_one_step() {
        let q = queue(3, true);
        q.push(frame(0.0, 1)).unwrap();
        q.push(frame(1.0, 1)).unwrap();

        // First next() only flips rindex_shown.
        q.next();
        assert!(q.rindex_shown());
        assert_eq!(q.nb_remaining(), 1);
        assert_eq!(q.peek_last().unwrap().pts, 0.0);
        assert_eq!(q.peek().unwrap().pts, 1.0);

        // Second next() releases the shown frame and moves on.
        q.next();
        assert_eq!(q.peek_last().unwrap().pts, 1.0);
        assert_eq!(q.nb_remaining(), 0);
    }

    #[test]
    fn peek_last_before_first_show_aliases_peek() {
        let q = queue(3, true);
        q.push(frame(5.0, 1)).unwrap();
        assert_eq!(q.peek_last().unwrap().pts, q.peek().unwrap().pts);
    }

    #[test]
    fn full_queue_blocks_writer_until_next() {
        let q = Arc::new(queue(2, false));
        q.push(frame(0.0, 1)).unwrap();
        q.push(frame(1.0, 1)).unwrap();

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.push(frame(2.0, 1)).is_ok());
        thread::sleep(Duration::from_millis(20));
        q.next();
        assert!(handle.join().unwrap());
        assert_eq!(q.nb_remaining(), 2);
    }

    #[test]
    fn abort_unblocks_writer_with_failure() {
        let abort = Arc::new(AtomicBool::new(false));
        let q = Arc::new(FrameQueue::new(1, false, Arc::clone(&abort)));
        q.push(frame(0.0, 1)).unwrap();

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.push(frame(1.0, 1)).is_err());
        thread::sleep(Duration::from_millis(20));
        abort.store(true, Ordering::Release);
        q.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn last_pos_requires_matching_serial() {
        let q = queue(3, true);
        let mut f = frame(0.0, 4);
        f.pos = 1234;
        q.push(f).unwrap();
        q.next();
        assert_eq!(q.last_pos(4), Some(1234));
        assert_eq!(q.last_pos(5), None);
    }

    #[test]
    fn subtitle_windows() {
        let f = Frame::subtitle(
            SubtitleData {
                text: "hi".into(),
                pts: Some(2_000_000),
                start_display_ms: 0,
                end_display_ms: 1500,
            },
            2.0,
            1,
        );
        assert_eq!(f.subtitle_start(), 2.0);
        assert_eq!(f.subtitle_end(), 3.5);
    }
}
