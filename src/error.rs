//! Error types for the Kolosal supernet framework

use thiserror::Error;

/// Result type alias for Kolosal operations
pub type Result<T> = std::result::Result<T, KolosalError>;

/// Main error type for the Kolosal supernet framework
#[derive(Error, Debug)]
pub enum KolosalError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Sample dimension out of range: {axis} = {requested}, must be in 1..={max}")]
    SampleDimOutOfRange {
        axis: &'static str,
        requested: usize,
        max: usize,
    },

    #[error("No sampled parameters: {0}")]
    NotSampled(String),

    #[error("Search space too small: requested {requested} distinct candidates, found {found} after {attempts} attempts")]
    SearchSpaceTooSmall {
        requested: usize,
        found: usize,
        attempts: usize,
    },

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Epoch {epoch} produced no usable loss ({skipped} update groups skipped)")]
    EmptyEpoch { epoch: usize, skipped: usize },

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for KolosalError {
    fn from(err: serde_json::Error) -> Self {
        KolosalError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for KolosalError {
    fn from(err: ndarray::ShapeError) -> Self {
        KolosalError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KolosalError::ConfigError("test error".to_string());
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_sample_dim_display() {
        let err = KolosalError::SampleDimOutOfRange {
            axis: "sample_out_dim",
            requested: 9,
            max: 8,
        };
        assert_eq!(
            err.to_string(),
            "Sample dimension out of range: sample_out_dim = 9, must be in 1..=8"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KolosalError = io_err.into();
        assert!(matches!(err, KolosalError::IoError(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: KolosalError = json_err.into();
        assert!(matches!(err, KolosalError::SerializationError(_)));
    }
}
