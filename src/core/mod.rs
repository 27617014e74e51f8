//! Core types shared by every stage of the autoencoder.
//!
//! This module provides:
//! - The crate-wide error taxonomy ([`WtaError`], [`WtaResult`])
//! - The [`Activation`] trait used by the encoder layers
//! - [`ReluActivation`], the rectifier applied after every encode layer
//!
//! ## Error Taxonomy
//!
//! ```text
//! InvalidConfig   -> raised at build time, no partial model is returned
//! ShapeMismatch   -> raised by the offending call, state is left unchanged
//! NonFinite       -> diverging training, surfaced to the training driver
//! ```

use ndarray::Array2;
use std::fmt;
use thiserror::Error;

/// Error type for autoencoder operations.
#[derive(Debug, Error)]
pub enum WtaError {
    /// Invalid model configuration (dims, sparsity, learning rate, initializers)
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A caller-supplied or stored tensor disagrees with the expected shape
    #[error("Shape mismatch: {what} must equal {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    /// An index fell outside the tensor it addresses
    #[error("Index out of range: {what} index {index} is not below {bound}")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    /// Lookup of a parameter slot that was never created
    #[error("Unknown parameter: {0}")]
    UnknownParam(String),

    /// Optimizer name that does not map to a supported update rule
    #[error("Unknown optimizer: {0}")]
    UnknownOptimizer(String),

    /// A model was driven with a session other than the one it was built in
    #[error("Session mismatch: model belongs to session {expected}, got session {got}")]
    SessionMismatch { expected: u64, got: u64 },

    /// Training produced a NaN or infinite loss
    #[error("Non-finite loss at step {step}")]
    NonFinite { step: u64 },

    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type WtaResult<T> = Result<T, WtaError>;

impl WtaError {
    /// Shorthand for a [`WtaError::ShapeMismatch`] on a named dimension.
    pub fn shape(what: impl Into<String>, expected: usize, got: usize) -> Self {
        WtaError::ShapeMismatch {
            what: what.into(),
            expected,
            got,
        }
    }
}

/// Activation function trait for layer nonlinearities.
///
/// The derivative is evaluated from the activation's *output*, which is what the
/// backward pass has cached. For the rectifier this is exact: `f'(x) = 1[f(x) > 0]`.
pub trait Activation: fmt::Debug {
    /// Apply activation elementwise: f(X)
    fn apply(&self, x: &Array2<f32>) -> Array2<f32>;

    /// Derivative f'(X) computed from Y = f(X)
    fn derivative_from_output(&self, y: &Array2<f32>) -> Array2<f32>;

    /// Name for debugging
    fn name(&self) -> &'static str;
}

/// Rectified linear unit: f(x) = max(0, x)
#[derive(Debug, Clone, Copy, Default)]
pub struct ReluActivation;

impl Activation for ReluActivation {
    fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        // Comparison instead of f32::max so negative zero never leaks into the code.
        x.mapv(|v| if v > 0.0 { v } else { 0.0 })
    }

    fn derivative_from_output(&self, y: &Array2<f32>) -> Array2<f32> {
        y.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
    }

    fn name(&self) -> &'static str {
        "relu"
    }
}
