//! Error types for greedy-infomax-rs.
//!
//! Failures fall into three families:
//! - configuration errors, raised before any gradient is computed
//! - numerical instability (non-finite log-variance, KL or loss values)
//! - shape mismatches between internal contracts
//!
//! Errors raised inside a module's forward pass are wrapped in
//! [`GimError::Module`] so the message names the module that failed.
//!
//! # Example
//!
//! ```rust
//! use greedy_infomax_rs::{GimConfig, GimError};
//!
//! let mut config = GimConfig::test();
//! config.architecture.modules.clear();
//! match config.validate() {
//!     Err(GimError::Config(msg)) => assert!(msg.contains("at least one module")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for greedy-infomax-rs operations.
pub type Result<T> = std::result::Result<T, GimError>;

/// Errors that can occur while building or running a module stack.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GimError {
    /// Tensor operation failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Incompatible or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal shape contract violated.
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected shape description.
        expected: String,
        /// Observed shape description.
        got: String,
    },

    /// A tensor contained NaN or infinite values.
    #[error("numerical instability: {tensor} is non-finite at {step} (first bad value: {value})")]
    NumericalInstability {
        /// Name of the offending tensor.
        tensor: String,
        /// Processing step that produced it.
        step: String,
        /// First non-finite value found.
        value: f32,
    },

    /// A failure inside a specific module of the stack.
    #[error("module {index}: {source}")]
    Module {
        /// 1-based module index.
        index: usize,
        /// Underlying failure.
        #[source]
        source: Box<GimError>,
    },

    /// Checkpoint save/load error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Data source error.
    #[error("data error: {0}")]
    Data(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl GimError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a numerical instability error.
    pub fn non_finite(tensor: impl Into<String>, step: impl Into<String>, value: f32) -> Self {
        Self::NumericalInstability {
            tensor: tensor.into(),
            step: step.into(),
            value,
        }
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Attribute this error to a module (1-based). Already attributed errors
    /// are returned unchanged.
    pub fn in_module(self, index: usize) -> Self {
        match self {
            Self::Module { .. } => self,
            other => Self::Module {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error (or the error it wraps) is a configuration error.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Module { source, .. } => source.is_config(),
            _ => false,
        }
    }

    /// Whether this error (or the error it wraps) is a numerical instability.
    pub fn is_numerical(&self) -> bool {
        match self {
            Self::NumericalInstability { .. } => true,
            Self::Module { source, .. } => source.is_numerical(),
            _ => false,
        }
    }
}

impl From<indicatif::style::TemplateError> for GimError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_display() {
        let error = GimError::config("prediction_step must be > 0");
        assert_eq!(
            error.to_string(),
            "configuration error: prediction_step must be > 0"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = GimError::shape_mismatch("contrastive loss", "[2, 4, 8]", "[2, 4, 16]");
        let msg = error.to_string();
        assert!(msg.contains("contrastive loss"));
        assert!(msg.contains("[2, 4, 8]"));
        assert!(msg.contains("[2, 4, 16]"));
    }

    #[test]
    fn test_in_module_wraps_once() {
        let error = GimError::non_finite("log_var", "encode", f32::NAN)
            .in_module(2)
            .in_module(5);
        match &error {
            GimError::Module { index, .. } => assert_eq!(*index, 2),
            other => panic!("expected Module variant, got {other:?}"),
        }
        assert!(error.is_numerical());
        assert!(!error.is_config());
        assert!(error.to_string().starts_with("module 2:"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "model-1.safetensors");
        let error: GimError = io_error.into();
        assert!(matches!(error, GimError::Io(_)));
        assert!(error.to_string().contains("model-1.safetensors"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: GimError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: GimError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }
}
