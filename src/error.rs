//! Error types for opening and reading evidence containers
//!
//! Only the container layer fails hard. Everything above it (volume
//! discovery, directory listing, extraction) degrades to sentinel values.

use std::fmt;
use std::io;

/// Result type alias for container operations
pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug)]
pub enum ContainerError {
    /// Extension is in neither the segmented nor the linear table
    UnsupportedFormat(String),
    /// I/O error on the container files
    Io(io::Error),
    /// Segment files could not be resolved or opened
    Segments(String),
    /// Container metadata is unreadable
    Corrupt(String),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::UnsupportedFormat(e) => write!(f, "Unsupported image format: {}", e),
            ContainerError::Io(e) => write!(f, "I/O error: {}", e),
            ContainerError::Segments(e) => write!(f, "Segment error: {}", e),
            ContainerError::Corrupt(e) => write!(f, "Corrupt container: {}", e),
        }
    }
}

impl std::error::Error for ContainerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ContainerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ContainerError {
    fn from(err: io::Error) -> Self {
        ContainerError::Io(err)
    }
}

impl From<ContainerError> for io::Error {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
