//! Error types for the training pipeline.

use thiserror::Error;

/// Result type alias for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Errors that can occur while preparing data, training, or checkpointing.
///
/// Every variant is fatal to the run: nothing here is retried internally,
/// errors propagate out of `main` as a nonzero exit with a diagnostic.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainError {
    /// Invalid run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset storage error (missing files, short records, unwritable cache).
    #[error("data error: {0}")]
    Data(String),

    /// Dataset archive download failed.
    #[error("download error: {0}")]
    Download(#[from] reqwest::Error),

    /// Checkpoint missing, unreadable, or structurally wrong.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Training step failed.
    #[error("training error: {0}")]
    Training(String),

    /// Tensor operation failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = TrainError::Config("batch_size must be > 0".to_string());
        assert_eq!(err.to_string(), "configuration error: batch_size must be > 0");

        let err = TrainError::Checkpoint("missing meta.epoch".to_string());
        assert_eq!(err.to_string(), "checkpoint error: missing meta.epoch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: TrainError = io_err.into();
        assert!(matches!(err, TrainError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((4, 5), DType::F32, &Device::Cpu).unwrap();
        let candle_err = a.matmul(&b).unwrap_err();
        let err: TrainError = candle_err.into();
        assert!(err.to_string().contains("candle error"));
    }

    #[test]
    fn test_result_alias() {
        fn fails() -> Result<()> {
            Err(TrainError::Data("truncated record".to_string()))
        }
        assert!(fails().is_err());
    }
}
