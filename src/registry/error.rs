//! Registry error types

use super::id::StreamId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Stream not found
    StreamNotFound(StreamId),
    /// A stream with this id is already registered
    StreamAlreadyExists(StreamId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::StreamNotFound(id) => write!(f, "Stream not found: {}", id),
            RegistryError::StreamAlreadyExists(id) => {
                write!(f, "Stream already registered: {}", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
