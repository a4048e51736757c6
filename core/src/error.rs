//! Error types for the core crate.

use thiserror::Error;

/// All possible errors from pure core logic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown data type: {0}")]
    UnknownDataType(String),

    #[error("unknown deployment mode: {0}")]
    UnknownMode(String),

    #[error("invalid cursor token: {0}")]
    InvalidCursor(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownDataType("widgets".into());
        assert_eq!(err.to_string(), "unknown data type: widgets");

        let err = Error::InvalidCursor("nope".into());
        assert_eq!(err.to_string(), "invalid cursor token: nope");
    }
}
