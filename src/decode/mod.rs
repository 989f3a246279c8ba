mod decoder;
mod packet_queue;

pub use decoder::{Decoder, audio_worker, subtitle_worker, video_worker};
pub use packet_queue::{PacketGet, PacketItem, PacketQueue};

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Wakeup line from the decoders back to the reader: "my queue ran dry,
/// stop sleeping and produce".
pub struct ReadSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReadSignal {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

impl Default for ReadSignal {
    fn default() -> Self {
        Self::new()
    }
}
