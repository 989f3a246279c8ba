use thiserror::Error;

use crate::media::MediaError;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Player-level errors.
///
/// Workers never surface per-frame failures through this type; a packet that
/// fails to decode is dropped where it happened. Only structural failures
/// (queue allocation, sink open after fallbacks, a broken input) reach here.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Cannot bring the session up at all. Maps to exit code 1.
    #[error("initialization failed: {0}")]
    FatalInit(String),

    /// The underlying byte stream broke mid-playback.
    #[error("input error: {0}")]
    Io(#[from] MediaError),

    /// The audio sink refused every format in the fallback sequence.
    #[error("audio sink refused all formats: {0}")]
    BackendRefusal(String),
}

impl PlayerError {
    pub(crate) fn init(message: impl Into<String>) -> Self {
        Self::FatalInit(message.into())
    }
}
