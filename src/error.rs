//! Error types for fusion-affect-rs.
//!
//! Every failure in the crate is fatal for the run that raised it: nothing is
//! retried, errors propagate to the caller and the CLI exits non-zero.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use fusion_affect_rs::{ExperimentConfig, FusionError};
//!
//! # fn main() {
//! match ExperimentConfig::from_preset("unknown") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(FusionError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for fusion-affect-rs operations.
pub type Result<T> = std::result::Result<T, FusionError>;

/// Errors that can occur while building datasets, training or evaluating.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FusionError {
    /// Unsupported model/modality/dataset/task combination or missing column.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Shape or width mismatch in the input table.
    #[error("data error: {0}")]
    Data(String),

    /// Non-finite loss or a covariance the regularization could not repair.
    #[error("numerical error at batch {batch}: {detail}")]
    Numerical {
        /// Index of the offending batch within the pass.
        batch: usize,
        /// What went wrong.
        detail: String,
    },

    /// Checkpoint write/read failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Text embedding provider failure.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl FusionError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a numerical error for the given batch.
    pub fn numerical(batch: usize, detail: impl Into<String>) -> Self {
        Self::Numerical {
            batch,
            detail: detail.into(),
        }
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an embedding error.
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Attach a batch index to a numerical error raised below the engine.
    ///
    /// Objectives do not know which batch they run on; the engine re-tags
    /// their errors before propagating them.
    #[must_use]
    pub fn at_batch(self, batch: usize) -> Self {
        match self {
            Self::Numerical { detail, .. } => Self::Numerical { batch, detail },
            other => other,
        }
    }
}

impl From<indicatif::style::TemplateError> for FusionError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FusionError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = FusionError::config("unknown model 'gpt'");
        assert_eq!(error.to_string(), "configuration error: unknown model 'gpt'");
    }

    #[test]
    fn test_data_error_creation() {
        let error = FusionError::data("row 3 has 7 signal values, expected 8");
        assert!(error.to_string().starts_with("data error"));
    }

    #[test]
    fn test_numerical_error_reports_batch() {
        let error = FusionError::numerical(12, "loss is NaN");
        assert_eq!(error.to_string(), "numerical error at batch 12: loss is NaN");
    }

    #[test]
    fn test_at_batch_retags_numerical_only() {
        let error = FusionError::numerical(0, "singular covariance").at_batch(5);
        assert!(matches!(error, FusionError::Numerical { batch: 5, .. }));

        let error = FusionError::data("bad").at_batch(5);
        assert!(matches!(error, FusionError::Data(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: FusionError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: FusionError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: FusionError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: FusionError = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert!(error.source().is_some());
    }
}
