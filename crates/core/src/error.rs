use serde::{Deserialize, Serialize};

/// Failures surfaced by a [`crate::RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Optimistic-concurrency clash: re-read current state and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    /// Watch resume point was compacted away; a fresh list is required.
    #[error("resource version too old: {0}")]
    ResourceVersionTooOld(String),
    /// A single delta could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
}

/// Coarse retry classes the controller reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    TransientInfra,
    Conflict,
    NotFound,
    PermanentLogic,
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Transport(_) | RemoteError::ResourceVersionTooOld(_) => ErrorClass::TransientInfra,
            RemoteError::Conflict(_) => ErrorClass::Conflict,
            RemoteError::NotFound(_) => ErrorClass::NotFound,
            RemoteError::Unauthorized(_) | RemoteError::AlreadyExists(_) | RemoteError::Decode(_) => {
                ErrorClass::PermanentLogic
            }
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, RemoteError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, RemoteError::Conflict(_)) }
    pub fn is_too_old(&self) -> bool { matches!(self, RemoteError::ResourceVersionTooOld(_)) }
}
