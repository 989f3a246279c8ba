/*!
    vidplay

    A media player core: a demux/decode/present pipeline with
    serial-numbered queues, three selectable master clocks, drift-aware
    frame scheduling and audio resampling rate-matching.

    Container parsing, codecs and the actual audio/video devices live
    behind traits in [`media`], [`audio`] and [`video`]; the crate ships a
    deterministic synthetic backend plus cpal-based audio output.
*/

pub mod audio;
pub mod clock;
pub mod decode;
pub mod error;
pub mod media;
pub mod options;
pub mod playback;
pub mod session;
pub mod video;

pub use error::{PlayerError, Result};
pub use options::{PlayerOptions, SyncMode};
pub use session::{Command, ExitReason, PlayerObserver, Session};
