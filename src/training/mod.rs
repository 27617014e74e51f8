//! Epoch loops and metrics.
//!
//! The lifetime mask is defined over exactly `batch_size` samples, so a
//! dataset is cut into full batches only. A trailing partial batch is dropped
//! and reported in [`EpochMetrics::dropped_samples`].

use crate::core::{WtaError, WtaResult};
use crate::model::WtaModel;
use crate::session::Session;
use log::{debug, warn};
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

/// Statistics for one pass over a dataset.
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    /// Mean of the per-batch summed losses
    pub avg_loss: f32,
    /// Number of batches processed
    pub num_batches: usize,
    /// Samples that went through the model
    pub num_samples: usize,
    /// Trailing samples that did not fill a batch
    pub dropped_samples: usize,
    /// Per-batch loss progression
    pub batch_losses: Vec<f32>,
}

/// Train for one epoch, one optimizer step per full batch.
///
/// With `shuffle`, sample order is permuted with `rng` before batching, so the
/// dropped tail differs from epoch to epoch.
///
/// # Errors
/// - `ShapeMismatch` if `data` does not have `input_dim` columns
/// - `InvalidConfig` if `data` holds fewer than `batch_size` rows
/// - `NonFinite` as soon as a batch loss is NaN or infinite; the update for
///   that batch has already been applied
pub fn train_epoch<R: Rng + ?Sized>(
    model: &WtaModel,
    session: &mut Session,
    data: &Array2<f32>,
    shuffle: bool,
    rng: &mut R,
) -> WtaResult<EpochMetrics> {
    let batch_size = model.config().batch_size;
    let num_batches = validate_dataset(model, data)?;

    let mut indices: Vec<usize> = (0..data.nrows()).collect();
    if shuffle {
        indices.shuffle(rng);
    }

    let mut batch_losses = Vec::with_capacity(num_batches);
    for chunk in indices.chunks_exact(batch_size) {
        let batch = extract_batch(data, chunk);
        let out = model.step(session, &batch, false)?;
        let step = session.global_step();
        if !out.loss.is_finite() {
            return Err(WtaError::NonFinite { step });
        }
        debug!("step {step}: batch loss {:.6}", out.loss);
        batch_losses.push(out.loss);
    }

    Ok(summarize(batch_losses, batch_size, data.nrows()))
}

/// Forward-only pass over every full batch in order.
///
/// Parameters and `global_step` are left untouched.
pub fn evaluate(
    model: &WtaModel,
    session: &mut Session,
    data: &Array2<f32>,
) -> WtaResult<EpochMetrics> {
    let batch_size = model.config().batch_size;
    let num_batches = validate_dataset(model, data)?;

    let indices: Vec<usize> = (0..num_batches * batch_size).collect();
    let mut batch_losses = Vec::with_capacity(num_batches);
    for chunk in indices.chunks_exact(batch_size) {
        let batch = extract_batch(data, chunk);
        batch_losses.push(model.step(session, &batch, true)?.loss);
    }

    Ok(summarize(batch_losses, batch_size, data.nrows()))
}

/// Returns the number of full batches in `data`.
fn validate_dataset(model: &WtaModel, data: &Array2<f32>) -> WtaResult<usize> {
    let config = model.config();
    if data.ncols() != config.input_dim {
        return Err(WtaError::shape(
            "dataset columns (input_dim)",
            config.input_dim,
            data.ncols(),
        ));
    }
    let num_batches = data.nrows() / config.batch_size;
    if num_batches == 0 {
        return Err(WtaError::InvalidConfig(format!(
            "dataset has {} samples, fewer than batch_size {}",
            data.nrows(),
            config.batch_size
        )));
    }
    let dropped = data.nrows() % config.batch_size;
    if dropped > 0 {
        warn!(
            "dropping {dropped} trailing samples that do not fill a batch of {}",
            config.batch_size
        );
    }
    Ok(num_batches)
}

#[allow(clippy::cast_precision_loss)]
fn summarize(batch_losses: Vec<f32>, batch_size: usize, total: usize) -> EpochMetrics {
    let num_batches = batch_losses.len();
    let avg_loss = if num_batches == 0 {
        0.0
    } else {
        batch_losses.iter().sum::<f32>() / num_batches as f32
    };
    let num_samples = num_batches * batch_size;
    EpochMetrics {
        avg_loss,
        num_batches,
        num_samples,
        dropped_samples: total - num_samples,
        batch_losses,
    }
}

/// Gather rows by index into a fresh batch matrix.
fn extract_batch(data: &Array2<f32>, indices: &[usize]) -> Array2<f32> {
    let mut batch = Array2::zeros((indices.len(), data.ncols()));
    for (local_idx, &global_idx) in indices.iter().enumerate() {
        batch.row_mut(local_idx).assign(&data.row(global_idx));
    }
    batch
}
