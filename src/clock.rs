use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Instant;

/// Clocks further apart than this are not corrected, only snapped.
pub const NOSYNC_THRESHOLD: f64 = 10.0;

/// Monotonic time in seconds since the first call in this process.
pub fn now_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

pub(crate) struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self {
            inner: AtomicU64::new(value.to_bits()),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> f64 {
        f64::from_bits(self.inner.load(ordering))
    }

    pub(crate) fn store(&self, value: f64, ordering: Ordering) {
        self.inner.store(value.to_bits(), ordering);
    }
}

/// Shared serial counter published by a packet queue.
///
/// A clock holds one of these instead of a pointer back into the queue; when
/// the cell moves past the clock's own serial the clock has been invalidated
/// by a seek.
pub struct SerialCell(AtomicI32);

impl SerialCell {
    pub fn new(value: i32) -> Arc<Self> {
        Arc::new(Self(AtomicI32::new(value)))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i32) {
        self.0.store(value, Ordering::Release);
    }
}

/// A pts-based clock with drift and speed.
///
/// All fields are atomics so the single designated writer never contends
/// with readers. Readers tolerate a momentarily torn view; the worst case is
/// an off-by-a-few-ms estimate that the next scheduler tick corrects.
pub struct Clock {
    pts: AtomicF64,
    pts_drift: AtomicF64,
    last_updated: AtomicF64,
    speed: AtomicF64,
    serial: AtomicI32,
    paused: AtomicBool,
    queue_serial: Arc<SerialCell>,
    tracks_self: bool,
}

impl Clock {
    /// A clock validated against the serial of a packet queue.
    pub fn new(queue_serial: Arc<SerialCell>) -> Self {
        let clock = Self {
            pts: AtomicF64::new(f64::NAN),
            pts_drift: AtomicF64::new(f64::NAN),
            last_updated: AtomicF64::new(now_seconds()),
            speed: AtomicF64::new(1.0),
            serial: AtomicI32::new(-1),
            paused: AtomicBool::new(false),
            queue_serial,
            tracks_self: false,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// A clock that is its own serial source and therefore never goes stale.
    /// Used for the external clock.
    pub fn standalone() -> Self {
        let mut clock = Self::new(SerialCell::new(-1));
        clock.tracks_self = true;
        clock.queue_serial.set(-1);
        clock
    }

    pub fn get(&self) -> f64 {
        self.get_at(now_seconds())
    }

    pub fn get_at(&self, now: f64) -> f64 {
        if self.queue_serial.get() != self.serial.load(Ordering::Acquire) {
            return f64::NAN;
        }
        if self.paused.load(Ordering::Acquire) {
            self.pts.load(Ordering::Acquire)
        } else {
            let speed = self.speed.load(Ordering::Acquire);
            let drift = self.pts_drift.load(Ordering::Acquire);
            let last_updated = self.last_updated.load(Ordering::Acquire);
            drift + now - (now - last_updated) * (1.0 - speed)
        }
    }

    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, now_seconds());
    }

    pub fn set_at(&self, pts: f64, serial: i32, now: f64) {
        self.pts.store(pts, Ordering::Release);
        self.last_updated.store(now, Ordering::Release);
        self.pts_drift.store(pts - now, Ordering::Release);
        self.serial.store(serial, Ordering::Release);
        if self.tracks_self {
            self.queue_serial.set(serial);
        }
    }

    /// Change speed without a discontinuity in the reported time.
    pub fn set_speed(&self, speed: f64) {
        self.set(self.get(), self.serial());
        self.speed.store(speed, Ordering::Release);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn speed(&self) -> f64 {
        self.speed.load(Ordering::Acquire)
    }

    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn pts(&self) -> f64 {
        self.pts.load(Ordering::Acquire)
    }

    pub fn last_updated(&self) -> f64 {
        self.last_updated.load(Ordering::Acquire)
    }
}

/// Snap `master` onto `slave` when the slave is valid and the master is
/// either invalid or too far away to be worth correcting gradually.
pub fn sync_clock_to_slave(master: &Clock, slave: &Clock) {
    let master_val = master.get();
    let slave_val = slave.get();
    if !slave_val.is_nan()
        && (master_val.is_nan() || (master_val - slave_val).abs() > NOSYNC_THRESHOLD)
    {
        master.set(slave_val, slave.serial());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn live_clock(serial: i32) -> (Clock, Arc<SerialCell>) {
        let cell = SerialCell::new(serial);
        let clock = Clock::new(Arc::clone(&cell));
        (clock, cell)
    }

    #[test]
    fn stale_serial_reads_nan() {
        let (clock, cell) = live_clock(3);
        clock.set_at(42.0, 3, 100.0);
        assert_relative_eq!(clock.get_at(100.5), 42.5);

        cell.set(4);
        assert!(clock.get_at(100.6).is_nan());
    }

    #[test]
    fn advances_at_unit_speed() {
        let (clock, _cell) = live_clock(1);
        clock.set_at(10.0, 1, 50.0);
        assert_relative_eq!(clock.get_at(50.0), 10.0);
        assert_relative_eq!(clock.get_at(53.0), 13.0);
    }

    #[test]
    fn set_from_own_value_is_a_noop() {
        let (clock, _cell) = live_clock(7);
        clock.set_at(5.0, 7, 20.0);
        let before = clock.get_at(21.0);
        clock.set_at(before, 7, 21.0);
        assert_relative_eq!(clock.get_at(21.0), before);
    }

    #[test]
    fn speed_change_is_continuous() {
        let (clock, _cell) = live_clock(2);
        clock.set_at(1.0, 2, 0.0);
        let before = clock.get();
        clock.set_speed(1.5);
        let after = clock.get();
        assert!((after - before).abs() < 1e-3);
    }

    #[test]
    fn paused_clock_reports_pts() {
        let (clock, _cell) = live_clock(1);
        clock.set_at(8.0, 1, 100.0);
        clock.set_paused(true);
        assert_relative_eq!(clock.get_at(130.0), 8.0);
    }

    #[test]
    fn standalone_clock_is_always_valid() {
        let clock = Clock::standalone();
        clock.set_at(3.0, 9, 10.0);
        assert_relative_eq!(clock.get_at(11.0), 4.0);
    }

    #[test]
    fn slave_snaps_invalid_master() {
        let master = Clock::standalone();
        let (slave, _cell) = live_clock(1);
        slave.set_at(25.0, 1, 0.0);

        // Fresh standalone master reads NaN until first set.
        sync_clock_to_slave(&master, &slave);
        assert!((master.get() - slave.get()).abs() < 1e-3);
    }

    #[test]
    fn nearby_master_is_left_alone() {
        let master = Clock::standalone();
        master.set_at(24.9, 1, 0.0);
        let (slave, _cell) = live_clock(1);
        slave.set_at(25.0, 1, 0.0);

        sync_clock_to_slave(&master, &slave);
        assert_relative_eq!(master.pts(), 24.9);
    }
}
