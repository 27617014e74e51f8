//! # fcwta
//!
//! A fully-connected winner-take-all (WTA) autoencoder that learns sparse codes
//! through a *lifetime sparsity* constraint.
//!
//! ## Overview
//!
//! Instead of penalizing activity within each sample, every hidden unit is
//! allowed to fire for only its `k = floor(sparsity * batch_size)` strongest
//! samples in a batch. All other activations of that unit are zeroed before
//! decoding, and gradients flow only through the survivors.
//!
//! ```text
//! input ─> EncoderStack ─> transpose ─> top-k mask ─> sparse code ─> Decoder ─> reconstruction
//!                                                                                  │
//!                                   optimizer <── Σ(reconstruction - input)² <──────┘
//! ```
//!
//! ## Structure
//!
//! - [`core`] - Error taxonomy and activations
//! - [`params`] - Parameter store with shared, named slots and initializers
//! - [`session`] - Explicit execution context (store + optimizer)
//! - [`encoder`] / [`decoder`] - Affine layers, forward and backward
//! - [`sparsity`] - Lifetime top-k mask
//! - [`loss`] / [`optim`] - Sum-of-squares loss and update rules
//! - [`model`] - [`WtaModel`] facade: `step`, `encode`, `dictionary`
//! - [`checkpoint`] - Save and restore parameters, step counter and optimizer slots
//! - [`training`] - Epoch loop with shuffling and metrics
//!
//! ## Example
//!
//! ```no_run
//! use fcwta::{ModelConfig, Session, WtaModel};
//! use ndarray::Array2;
//!
//! let config = ModelConfig::new(4, 20);
//! let mut session = Session::new();
//! let model = WtaModel::build(config, &mut session)?;
//!
//! let batch = Array2::<f32>::ones((20, 4));
//! let out = model.step(&mut session, &batch, false)?;
//! println!("loss = {}", out.loss);
//! # Ok::<(), fcwta::WtaError>(())
//! ```

pub mod checkpoint;
pub mod core;
pub mod decoder;
pub mod encoder;
pub mod loss;
pub mod model;
pub mod optim;
pub mod params;
pub mod session;
pub mod sparsity;
pub mod training;

pub use checkpoint::{load_checkpoint, load_model, save_checkpoint, Checkpoint};
pub use crate::core::{Activation, ReluActivation, WtaError, WtaResult};
pub use model::{StepOutput, WtaModel};
pub use optim::{Gradients, Optimizer, OptimizerKind, OptimizerState};
pub use params::{Initializer, ParamStore};
pub use session::Session;
pub use training::{evaluate, train_epoch, EpochMetrics};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model configuration.
///
/// Fixed once a model is built. `input_dim` and `batch_size` have no sensible
/// defaults and are passed to [`ModelConfig::new`]; everything else can be
/// overridden with struct update syntax:
///
/// ```
/// use fcwta::ModelConfig;
///
/// let config = ModelConfig {
///     hidden_units: 64,
///     sparsity: 0.1,
///     ..ModelConfig::new(784, 100)
/// };
/// assert_eq!(config.k().unwrap(), 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Dimensionality of each input sample
    pub input_dim: usize,
    /// Number of samples per training step (the mask needs exactly this many)
    pub batch_size: usize,
    /// Fraction of the batch each hidden unit may fire for. Default 0.05.
    #[serde(default = "defaults::sparsity")]
    pub sparsity: f64,
    /// Width of the code. Default 2.
    #[serde(default = "defaults::hidden_units")]
    pub hidden_units: usize,
    /// Number of ReLU encode layers. Default 3.
    #[serde(default = "defaults::encode_layers")]
    pub encode_layers: usize,
    /// Default 1e-2.
    #[serde(default = "defaults::learning_rate")]
    pub learning_rate: f32,
    /// Decode with the transpose of the final encoder matrix. Default true.
    #[serde(default = "defaults::tie_weights")]
    pub tie_weights: bool,
    /// Update rule. Default Adam.
    #[serde(default = "defaults::optimizer")]
    pub optimizer: OptimizerKind,
    /// Default N(0, 0.01²), seed 1.
    #[serde(default = "Initializer::default_weights")]
    pub weight_initializer: Initializer,
    /// Default constant 0.01.
    #[serde(default = "Initializer::default_biases")]
    pub bias_initializer: Initializer,
    /// Scope prefix for parameter names. Default "FCWTA".
    #[serde(default = "defaults::name")]
    pub name: String,
}

mod defaults {
    use crate::OptimizerKind;

    pub fn sparsity() -> f64 {
        0.05
    }
    pub fn hidden_units() -> usize {
        2
    }
    pub fn encode_layers() -> usize {
        3
    }
    pub fn learning_rate() -> f32 {
        1e-2
    }
    pub fn tie_weights() -> bool {
        true
    }
    pub fn optimizer() -> OptimizerKind {
        OptimizerKind::Adam
    }
    pub fn name() -> String {
        "FCWTA".to_string()
    }
}

impl ModelConfig {
    pub fn new(input_dim: usize, batch_size: usize) -> Self {
        Self {
            input_dim,
            batch_size,
            sparsity: defaults::sparsity(),
            hidden_units: defaults::hidden_units(),
            encode_layers: defaults::encode_layers(),
            learning_rate: defaults::learning_rate(),
            tie_weights: defaults::tie_weights(),
            optimizer: defaults::optimizer(),
            weight_initializer: Initializer::default_weights(),
            bias_initializer: Initializer::default_biases(),
            name: defaults::name(),
        }
    }

    /// Winners per hidden unit, `floor(sparsity * batch_size)`.
    pub fn k(&self) -> WtaResult<usize> {
        sparsity::sparsity_k(self.sparsity, self.batch_size)
    }

    /// Check every field. Returns `k` on success.
    ///
    /// # Errors
    /// `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> WtaResult<usize> {
        let positive = [
            ("input_dim", self.input_dim),
            ("batch_size", self.batch_size),
            ("hidden_units", self.hidden_units),
            ("encode_layers", self.encode_layers),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(WtaError::InvalidConfig(format!("{field} must be > 0")));
            }
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(WtaError::InvalidConfig(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        if self.name.is_empty() {
            return Err(WtaError::InvalidConfig("name must not be empty".to_string()));
        }
        self.weight_initializer.validate()?;
        self.bias_initializer.validate()?;
        self.k()
    }

    /// Scoped slot name, e.g. `FCWTA/encode_W_0`.
    pub fn param_name(&self, local: &str) -> String {
        format!("{}/{}", self.name, local)
    }

    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> WtaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
