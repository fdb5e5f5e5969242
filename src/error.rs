use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Cooperative stop request honored mid-loop. Not a failure: the task
    /// executor maps this to an interrupted completion with no error.
    #[error("stopped by request")]
    Stopped,
}

impl PatchError {
    /// True when this error represents a cooperative cancellation rather
    /// than a real failure.
    pub fn is_stop(&self) -> bool {
        matches!(self, PatchError::Stopped)
    }
}
