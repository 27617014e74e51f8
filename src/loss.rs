//! Reconstruction loss.
//!
//! `L = Σ (decoded - input)²` over the whole `[batch, input_dim]` tensor,
//! summed rather than averaged.

use ndarray::{Array2, Zip};

pub fn sum_squared_error(decoded: &Array2<f32>, input: &Array2<f32>) -> f32 {
    Zip::from(decoded)
        .and(input)
        .fold(0.0f32, |acc, &d, &x| acc + (d - x) * (d - x))
}

/// dL/d decoded = 2 (decoded - input)
pub fn sum_squared_error_grad(decoded: &Array2<f32>, input: &Array2<f32>) -> Array2<f32> {
    (decoded - input) * 2.0
}
