//! Error Handling Module
//!
//! Defines the error type shared by the open-set training library.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for open-set semi-supervised training
#[derive(Error, Debug)]
pub enum OpenSetError {
    /// A dataset-native category id has no entry in the class index mapping
    #[error("Category id {0} is not present in the class index mapping")]
    UnknownCategory(u64),

    /// Tensor, artifact or checkpoint shape disagrees with the expected layout
    #[error("Shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error saving or loading a model record
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { path: PathBuf, message: String },

    /// Error reading tensor data back to the host
    #[error("Tensor data error: {0}")]
    Tensor(String),

    /// Label outside the dense class id range
    #[error("Label {label} is outside the class range 0..{num_classes}")]
    LabelOutOfRange { label: i64, num_classes: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OpenSetError {
    /// Build a shape mismatch error
    pub fn shape(context: impl Into<String>, expected: Vec<usize>, found: Vec<usize>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    /// Build a checkpoint error from any recorder failure
    pub fn checkpoint(path: impl Into<PathBuf>, err: impl std::fmt::Debug) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: format!("{:?}", err),
        }
    }
}

/// Convenience Result type for open-set training operations
pub type Result<T> = std::result::Result<T, OpenSetError>;

/// Extension trait for turning burn `TensorData` conversion failures into crate errors
pub trait TensorResultExt<T> {
    /// Attach a short description of what was being read
    fn tensor_context(self, what: &str) -> Result<T>;
}

impl<T, E: std::fmt::Debug> TensorResultExt<T> for std::result::Result<T, E> {
    fn tensor_context(self, what: &str) -> Result<T> {
        self.map_err(|e| OpenSetError::Tensor(format!("{}: {:?}", what, e)))
    }
}
