pub mod frame;
pub mod frame_queue;
pub mod scheduler;
pub mod sync;

pub use frame::{Frame, FramePayload};
pub use frame_queue::{
    FrameQueue, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE,
};
pub use scheduler::{REFRESH_RATE, Scheduler};
pub use sync::{AudioCompensator, SyncState, vp_duration};
