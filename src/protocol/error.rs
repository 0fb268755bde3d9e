use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated frame: expected {expected} payload bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: missing action")]
    MissingAction,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Errors after which the same connection can carry on with the next frame.
    pub fn keeps_connection(&self) -> bool {
        matches!(self, ProtocolError::Decode(_) | ProtocolError::MissingAction)
    }
}
