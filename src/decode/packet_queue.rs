use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::clock::SerialCell;
use crate::media::Packet;

/// Fixed bookkeeping cost charged per queued entry on top of payload bytes.
const PACKET_OVERHEAD: usize = mem::size_of::<Packet>();

/// An entry handed out by [`PacketQueue::get`].
#[derive(Debug)]
pub enum PacketItem {
    /// A demuxed packet tagged with the serial in effect when it was queued.
    Packet { packet: Packet, serial: i32 },
    /// Discontinuity barrier: discard codec state, subsequent packets carry
    /// `serial`.
    Flush { serial: i32 },
}

impl PacketItem {
    pub fn serial(&self) -> i32 {
        match self {
            PacketItem::Packet { serial, .. } => *serial,
            PacketItem::Flush { serial } => *serial,
        }
    }
}

pub enum PacketGet {
    Item(PacketItem),
    Aborted,
    /// Non-blocking get on an empty queue.
    Empty,
}

struct QueueInner {
    items: VecDeque<PacketItem>,
    nb_packets: usize,
    size: usize,
    /// Sum of packet durations, in the stream time base.
    duration: i64,
    serial: i32,
}

/// FIFO of demuxed packets shared between the reader and one decoder.
///
/// Every entry carries the serial current at enqueue time; enqueueing a
/// flush barrier bumps the serial, which is how consumers detect packets
/// that predate a seek.
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    abort: Arc<AtomicBool>,
    serial_cell: Arc<SerialCell>,
}

impl PacketQueue {
    /// Queues start out aborted; `start` makes them usable.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0,
                serial: 0,
            }),
            cond: Condvar::new(),
            abort: Arc::new(AtomicBool::new(true)),
            serial_cell: SerialCell::new(0),
        }
    }

    /// Shared abort flag, also observed by the paired frame queue.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Live serial handle for clocks.
    pub fn serial_cell(&self) -> Arc<SerialCell> {
        Arc::clone(&self.serial_cell)
    }

    pub fn put(&self, packet: Packet) -> Result<(), ()> {
        if self.abort.load(Ordering::Acquire) {
            return Err(());
        }
        let mut inner = self.inner.lock();
        let serial = inner.serial;
        inner.nb_packets += 1;
        inner.size += packet.data.len() + PACKET_OVERHEAD;
        inner.duration += packet.duration;
        inner.items.push_back(PacketItem::Packet { packet, serial });
        self.cond.notify_one();
        Ok(())
    }

    /// Enqueue a flush barrier and bump the serial. Returns the new serial.
    pub fn put_flush(&self) -> i32 {
        let mut inner = self.inner.lock();
        inner.serial += 1;
        let serial = inner.serial;
        self.serial_cell.set(serial);
        inner.nb_packets += 1;
        inner.size += PACKET_OVERHEAD;
        inner.items.push_back(PacketItem::Flush { serial });
        self.cond.notify_one();
        serial
    }

    pub fn get(&self, block: bool) -> PacketGet {
        let mut inner = self.inner.lock();
        loop {
            if self.abort.load(Ordering::Acquire) {
                return PacketGet::Aborted;
            }
            if let Some(item) = inner.items.pop_front() {
                inner.nb_packets -= 1;
                match &item {
                    PacketItem::Packet { packet, .. } => {
                        inner.size -= packet.data.len() + PACKET_OVERHEAD;
                        inner.duration -= packet.duration;
                    }
                    PacketItem::Flush { .. } => inner.size -= PACKET_OVERHEAD,
                }
                return PacketGet::Item(item);
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Drop all queued entries. Leaves the serial untouched.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.nb_packets = 0;
        inner.size = 0;
        inner.duration = 0;
    }

    /// Clear abort and open a fresh epoch.
    pub fn start(&self) {
        self.abort.store(false, Ordering::Release);
        self.put_flush();
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().nb_packets
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Queued duration in the stream time base.
    pub fn duration(&self) -> i64 {
        self.inner.lock().duration
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().serial
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn packet(bytes: usize, duration: i64) -> Packet {
        Packet {
            stream_index: 0,
            data: Arc::new(vec![0u8; bytes]),
            pts: Some(0),
            dts: Some(0),
            duration,
            pos: -1,
        }
    }

    #[test]
    fn put_fails_until_started() {
        let q = PacketQueue::new();
        assert!(q.put(packet(10, 1)).is_err());
        q.start();
        assert!(q.put(packet(10, 1)).is_ok());
    }

    #[test]
    fn counters_track_puts_and_gets() {
        let q = PacketQueue::new();
        q.start();
        // Drain the barrier from start().
        assert!(matches!(
            q.get(true),
            PacketGet::Item(PacketItem::Flush { .. })
        ));

        q.put(packet(100, 10)).unwrap();
        q.put(packet(50, 5)).unwrap();
        assert_eq!(q.nb_packets(), 2);
        assert_eq!(q.size(), 150 + 2 * PACKET_OVERHEAD);
        assert_eq!(q.duration(), 15);

        match q.get(true) {
            PacketGet::Item(PacketItem::Packet { packet, serial }) => {
                assert_eq!(packet.data.len(), 100);
                assert_eq!(serial, 1);
            }
            _ => panic!("expected a packet"),
        }
        assert_eq!(q.nb_packets(), 1);
        assert_eq!(q.size(), 50 + PACKET_OVERHEAD);
        assert_eq!(q.duration(), 5);
    }

    #[test]
    fn flush_barrier_bumps_serial_for_later_packets() {
        let q = PacketQueue::new();
        q.start();
        q.put(packet(1, 0)).unwrap();
        let new_serial = q.put_flush();
        q.put(packet(1, 0)).unwrap();

        assert_eq!(new_serial, 2);
        assert_eq!(q.serial(), 2);
        assert_eq!(q.serial_cell().get(), 2);

        // start barrier, old packet, new barrier, new packet
        let serials: Vec<i32> = std::iter::from_fn(|| match q.get(false) {
            PacketGet::Item(item) => Some(item.serial()),
            _ => None,
        })
        .collect();
        assert_eq!(serials, vec![1, 1, 2, 2]);
    }

    #[test]
    fn flush_drops_content_but_keeps_serial() {
        let q = PacketQueue::new();
        q.start();
        q.put(packet(10, 3)).unwrap();
        let serial = q.serial();
        q.flush();
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.size(), 0);
        assert_eq!(q.duration(), 0);
        assert_eq!(q.serial(), serial);
        assert!(matches!(q.get(false), PacketGet::Empty));
    }

    #[test]
    fn abort_wakes_blocked_getter() {
        let q = Arc::new(PacketQueue::new());
        q.start();
        // Drain the start barrier so the getter actually blocks.
        q.get(true);

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || matches!(q2.get(true), PacketGet::Aborted));
        thread::sleep(Duration::from_millis(20));
        q.abort();
        assert!(handle.join().unwrap());
    }
}
