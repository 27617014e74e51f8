//! Lifetime sparsity: per hidden unit, keep only the top-k samples of a batch.
//!
//! Sparsity is enforced across the batch, not within a sample, so selection
//! runs along the batch axis of the *transposed* code:
//!
//! ```text
//! encoded    [batch, hidden]
//!   -> transpose                      [hidden, batch]
//!   -> top_k_indices (per row)        [hidden, k]
//!   -> scatter_coordinates            hidden * k pairs (row, col)
//!   -> scatter_ones                   mask [hidden, batch]
//! sparse = encoded ⊙ maskᵀ            [batch, hidden]
//! ```
//!
//! Selection uses the total order "larger value first, then lower batch
//! index", so equal activations at the k-th rank resolve to the earliest
//! samples and repeated calls on the same input pick the same positions.

use crate::core::{WtaError, WtaResult};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Number of winners per hidden unit: `floor(sparsity * batch_size)`.
///
/// # Errors
/// `InvalidConfig` unless `sparsity ∈ (0, 1]` and `0 < k <= batch_size`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn sparsity_k(sparsity: f64, batch_size: usize) -> WtaResult<usize> {
    if !(sparsity > 0.0 && sparsity <= 1.0) {
        return Err(WtaError::InvalidConfig(format!(
            "sparsity must be in (0, 1], got {sparsity}"
        )));
    }
    let k = (sparsity * batch_size as f64).floor() as usize;
    if k == 0 || k > batch_size {
        return Err(WtaError::InvalidConfig(format!(
            "sparsity {sparsity} with batch_size {batch_size} gives k = {k}; need 0 < k <= batch_size"
        )));
    }
    Ok(k)
}

/// Column indices of the `k` largest entries of every row.
///
/// `activations` is the transposed code, `[hidden, batch]`. The result has
/// shape `[hidden, k]`; the order within a row is unspecified but stable for
/// a given input. Rows are processed in parallel.
///
/// # Errors
/// `InvalidConfig` if `k == 0` or `k` exceeds the row length.
pub fn top_k_indices(activations: ArrayView2<'_, f32>, k: usize) -> WtaResult<Array2<usize>> {
    let (rows, cols) = activations.dim();
    if k == 0 || k > cols {
        return Err(WtaError::InvalidConfig(format!(
            "top-k needs 0 < k <= {cols}, got k = {k}"
        )));
    }

    let selected: Vec<Vec<usize>> = (0..rows)
        .into_par_iter()
        .map(|r| select_row(activations.row(r), k))
        .collect();

    Ok(Array2::from_shape_vec(
        (rows, k),
        selected.into_iter().flatten().collect(),
    )?)
}

fn select_row(row: ArrayView1<'_, f32>, k: usize) -> Vec<usize> {
    let rank = |a: &usize, b: &usize| -> Ordering {
        row[*b].total_cmp(&row[*a]).then_with(|| a.cmp(b))
    };
    let mut order: Vec<usize> = (0..row.len()).collect();
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, rank);
        order.truncate(k);
    }
    order
}

/// Expand `[hidden, k]` top-k indices into explicit `(row, column)` pairs.
///
/// One pair per (hidden unit, selected batch index), grouped by hidden unit.
pub fn scatter_coordinates(top_indices: &Array2<usize>) -> Vec<[usize; 2]> {
    top_indices
        .indexed_iter()
        .map(|((row, _), &col)| [row, col])
        .collect()
}

/// Write 1 at every coordinate into a zero matrix of `shape`.
///
/// # Errors
/// `IndexOutOfRange` if any coordinate falls outside `shape`.
pub fn scatter_ones(coords: &[[usize; 2]], shape: (usize, usize)) -> WtaResult<Array2<f32>> {
    let mut mask = Array2::zeros(shape);
    for &[row, col] in coords {
        if row >= shape.0 {
            return Err(WtaError::IndexOutOfRange {
                what: "mask row",
                index: row,
                bound: shape.0,
            });
        }
        if col >= shape.1 {
            return Err(WtaError::IndexOutOfRange {
                what: "mask column",
                index: col,
                bound: shape.1,
            });
        }
        mask[[row, col]] = 1.0;
    }
    Ok(mask)
}

/// Binary lifetime mask `[hidden, batch]` for a code `[batch, hidden]`.
///
/// Each row holds exactly `k` ones at the batch positions of that unit's `k`
/// largest activations. `k == batch` yields all ones.
pub fn lifetime_mask(encoded: ArrayView2<'_, f32>, k: usize) -> WtaResult<Array2<f32>> {
    let encoded_t = encoded.t();
    let top = top_k_indices(encoded_t, k)?;
    let coords = scatter_coordinates(&top);
    scatter_ones(&coords, encoded_t.dim())
}

/// `values ⊙ maskᵀ`: zero every non-selected entry, keep magnitudes elsewhere.
///
/// Used both on the code in the forward pass and on its gradient in the
/// backward pass.
///
/// # Errors
/// `ShapeMismatch` unless `mask` is the transpose shape of `values`.
pub fn apply_mask(values: ArrayView2<'_, f32>, mask: &Array2<f32>) -> WtaResult<Array2<f32>> {
    let (batch, hidden) = values.dim();
    if mask.nrows() != hidden {
        return Err(WtaError::shape("mask rows (hidden units)", hidden, mask.nrows()));
    }
    if mask.ncols() != batch {
        return Err(WtaError::shape("mask columns (batch size)", batch, mask.ncols()));
    }
    Ok(&values * &mask.t())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Axis};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_code(batch: usize, hidden: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((batch, hidden), |_| rng.gen_range(0.0..1.0))
    }

    #[test]
    fn test_sparsity_k_floors() {
        assert_eq!(sparsity_k(0.1, 20).unwrap(), 2);
        assert_eq!(sparsity_k(0.05, 100).unwrap(), 5);
        assert_eq!(sparsity_k(0.7, 10).unwrap(), 7);
        assert_eq!(sparsity_k(1.0, 8).unwrap(), 8);
    }

    #[test]
    fn test_sparsity_k_rejects_zero_and_out_of_range() {
        assert!(sparsity_k(0.05, 10).is_err()); // floor(0.5) = 0
        assert!(sparsity_k(0.0, 10).is_err());
        assert!(sparsity_k(1.5, 10).is_err());
        assert!(sparsity_k(f64::NAN, 10).is_err());
    }

    #[test]
    fn test_top_k_indices_small() {
        let acts = array![[0.1, 0.9, 0.5, 0.7], [3.0, 1.0, 2.0, 0.0]];
        let top = top_k_indices(acts.view(), 2).unwrap();
        assert_eq!(top.dim(), (2, 2));

        let mut row0: Vec<usize> = top.row(0).to_vec();
        let mut row1: Vec<usize> = top.row(1).to_vec();
        row0.sort_unstable();
        row1.sort_unstable();
        assert_eq!(row0, vec![1, 3]);
        assert_eq!(row1, vec![0, 2]);
    }

    #[test]
    fn test_top_k_rejects_bad_k() {
        let acts = array![[1.0, 2.0]];
        assert!(top_k_indices(acts.view(), 0).is_err());
        assert!(top_k_indices(acts.view(), 3).is_err());
    }

    #[test]
    fn test_ties_resolve_to_lower_index() {
        let acts = array![[1.0, 1.0, 1.0, 1.0, 0.5]];
        let top = top_k_indices(acts.view(), 2).unwrap();
        let mut picked = top.row(0).to_vec();
        picked.sort_unstable();
        assert_eq!(picked, vec![0, 1]);

        let again = top_k_indices(acts.view(), 2).unwrap();
        assert_eq!(top, again);
    }

    #[test]
    fn test_scatter_coordinates_grouped_by_row() {
        let top = array![[3usize, 1], [0, 2]];
        assert_eq!(
            scatter_coordinates(&top),
            vec![[0, 3], [0, 1], [1, 0], [1, 2]]
        );
    }

    #[test]
    fn test_scatter_ones_and_bounds() {
        let mask = scatter_ones(&[[0, 1], [1, 0]], (2, 3)).unwrap();
        assert_eq!(mask, array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
        assert!(matches!(
            scatter_ones(&[[2, 0]], (2, 3)),
            Err(WtaError::IndexOutOfRange { .. })
        ));
        assert!(scatter_ones(&[[0, 3]], (2, 3)).is_err());
    }

    #[test]
    fn test_mask_has_exactly_k_ones_per_unit() {
        for (batch, hidden, k) in [(20, 2, 2), (64, 16, 3), (10, 5, 10), (7, 3, 1)] {
            let code = random_code(batch, hidden, 11);
            let mask = lifetime_mask(code.view(), k).unwrap();
            assert_eq!(mask.dim(), (hidden, batch));
            for row in mask.axis_iter(Axis(0)) {
                assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), k);
                assert_eq!(row.iter().filter(|&&v| v == 0.0).count(), batch - k);
            }
        }
    }

    #[test]
    fn test_mask_selects_largest_by_brute_force() {
        let (batch, hidden, k) = (30, 6, 4);
        let code = random_code(batch, hidden, 5);
        let mask = lifetime_mask(code.view(), k).unwrap();

        for unit in 0..hidden {
            let mut column: Vec<f32> = code.column(unit).to_vec();
            column.sort_by(|a, b| b.total_cmp(a));
            let threshold = column[k - 1];

            for sample in 0..batch {
                let selected = mask[[unit, sample]] == 1.0;
                let value = code[[sample, unit]];
                if selected {
                    assert!(value >= threshold);
                } else {
                    assert!(value <= threshold);
                }
            }
        }
    }

    #[test]
    fn test_full_k_mask_is_all_ones() {
        let code = random_code(8, 3, 2);
        let mask = lifetime_mask(code.view(), 8).unwrap();
        assert!(mask.iter().all(|&v| v == 1.0));
        assert_eq!(apply_mask(code.view(), &mask).unwrap(), code);
    }

    #[test]
    fn test_apply_mask_preserves_magnitude() {
        let code = random_code(12, 4, 9);
        let mask = lifetime_mask(code.view(), 3).unwrap();
        let sparse = apply_mask(code.view(), &mask).unwrap();
        for ((i, j), &v) in sparse.indexed_iter() {
            if mask[[j, i]] == 1.0 {
                assert_eq!(v, code[[i, j]]);
            } else {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn test_apply_mask_shape_check() {
        let code = random_code(4, 2, 1);
        let wrong = Array2::ones((4, 2));
        assert!(matches!(
            apply_mask(code.view(), &wrong),
            Err(WtaError::ShapeMismatch { .. })
        ));
    }
}
