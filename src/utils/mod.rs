//! Utilities module for logging, metrics, artifacts and errors
//!
//! This module provides:
//! - Structured logging with tracing
//! - Open-set metrics (confident accuracy, unknown rate, macro-F1)
//! - Dense array dumps for centroids and pseudo-labels
//! - The crate error type
//! - Host copies of tensors

pub mod artifacts;
pub mod error;
pub mod logging;
pub mod metrics;

use burn::prelude::*;

use error::TensorResultExt;

pub use error::{OpenSetError, Result};
pub use logging::init_logging;
pub use metrics::{macro_accuracy, OpenSetReport};

/// Copy a float tensor to the host as `f32`, whatever the backend's float element
pub fn host_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>, what: &str) -> Result<Vec<f32>> {
    tensor.into_data().convert::<f32>().to_vec().tensor_context(what)
}

/// Copy an int tensor to the host as `i64`, whatever the backend's int element
pub fn host_i64<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>, what: &str) -> Result<Vec<i64>> {
    tensor.into_data().convert::<i64>().to_vec().tensor_context(what)
}

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}
