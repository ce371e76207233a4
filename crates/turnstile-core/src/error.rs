use thiserror::Error;

/// Discriminated failure of a core operation.
///
/// Every variant is local to the operation that raised it; none of them
/// stops a running recognition session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccessError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("incomplete input: {0} must not be empty")]
    IncompleteInput(&'static str),
    #[error("student id already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("no face detected in the current frame")]
    NoFaceDetected,
    #[error("{0} faces in frame; enrollment requires exactly one")]
    MultipleFaces(usize),
    #[error("no recognized identity to attribute the event to")]
    NoCurrentIdentity,
    #[error("invalid action: {0:?} (expected Entry or Exit)")]
    InvalidAction(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl AccessError {
    pub(crate) fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        AccessError::InvalidInput(format!(
            "embedding dimension mismatch: expected {expected}, got {actual}"
        ))
    }

    /// Stable kind name, used at the IPC boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::InvalidInput(_) => "InvalidInput",
            AccessError::IncompleteInput(_) => "IncompleteInput",
            AccessError::DuplicateIdentity(_) => "DuplicateIdentity",
            AccessError::NoFaceDetected => "NoFaceDetected",
            AccessError::MultipleFaces(_) => "MultipleFaces",
            AccessError::NoCurrentIdentity => "NoCurrentIdentity",
            AccessError::InvalidAction(_) => "InvalidAction",
            AccessError::StorageUnavailable(_) => "StorageUnavailable",
        }
    }
}
