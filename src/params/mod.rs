//! Parameter store: named, shape-checked tensor slots.
//!
//! Every weight and bias in the model lives in exactly one slot of a
//! [`ParamStore`]. Slots are handed out as shared handles
//! (`Rc<RefCell<_>>`), so two call sites that request the same name hold the
//! same storage. This is how the tied decoder reads the final encoder matrix:
//!
//! ```text
//! encode_W_{last} ──┬── EncoderStack (last DenseLayer)
//!                   └── Decoder (tied, read transposed)
//! ```
//!
//! The store also owns the `global_step` counter, which only moves forward.

use crate::core::{WtaError, WtaResult};
use log::debug;
use ndarray::{Array, Array1, Array2, ArrayD, ArrayViewMutD, Dimension, ShapeBuilder};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Shared handle to a weight matrix.
pub type SharedMatrix = Rc<RefCell<Array2<f32>>>;

/// Shared handle to a bias vector.
pub type SharedVector = Rc<RefCell<Array1<f32>>>;

/// Initialization policy for a freshly created slot.
///
/// Seeded variants are deterministic: the slot created `n`-th in a store draws
/// from a generator seeded with `seed + n`, so two stores populated in the same
/// order hold bit-identical values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    /// Gaussian N(mean, std²)
    Normal {
        mean: f32,
        std: f32,
        seed: Option<u64>,
    },
    /// Uniform on [low, high)
    Uniform {
        low: f32,
        high: f32,
        seed: Option<u64>,
    },
    /// Every element set to `value`
    Constant { value: f32 },
    Zeros,
}

impl Initializer {
    /// Weight default: N(0, 0.01²) with seed 1.
    pub fn default_weights() -> Self {
        Initializer::Normal {
            mean: 0.0,
            std: 0.01,
            seed: Some(1),
        }
    }

    /// Bias default: constant 0.01.
    pub fn default_biases() -> Self {
        Initializer::Constant { value: 0.01 }
    }

    /// Check the distribution parameters without drawing anything.
    pub fn validate(&self) -> WtaResult<()> {
        match *self {
            Initializer::Normal { mean, std, .. } => {
                if !mean.is_finite() || !std.is_finite() || std < 0.0 {
                    return Err(WtaError::InvalidConfig(format!(
                        "Normal initializer needs finite mean and std >= 0, got mean={mean}, std={std}"
                    )));
                }
            }
            Initializer::Uniform { low, high, .. } => {
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return Err(WtaError::InvalidConfig(format!(
                        "Uniform initializer needs finite low < high, got [{low}, {high})"
                    )));
                }
            }
            Initializer::Constant { value } => {
                if !value.is_finite() {
                    return Err(WtaError::InvalidConfig(format!(
                        "Constant initializer must be finite, got {value}"
                    )));
                }
            }
            Initializer::Zeros => {}
        }
        Ok(())
    }

    /// Draw a tensor of the given shape.
    ///
    /// `offset` is the creation index of the slot within its store.
    pub fn sample<Sh, D>(&self, shape: Sh, offset: u64) -> WtaResult<Array<f32, D>>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        self.validate()?;
        let value = match *self {
            Initializer::Normal { mean, std, seed } => {
                let dist = Normal::new(mean, std)
                    .map_err(|e| WtaError::InvalidConfig(format!("Normal initializer: {e}")))?;
                Array::random_using(shape, dist, &mut rng_for(seed, offset))
            }
            Initializer::Uniform { low, high, seed } => {
                Array::random_using(shape, Uniform::new(low, high), &mut rng_for(seed, offset))
            }
            Initializer::Constant { value } => Array::from_elem(shape, value),
            Initializer::Zeros => Array::zeros(shape),
        };
        Ok(value)
    }
}

fn rng_for(seed: Option<u64>, offset: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(offset)),
        None => StdRng::from_entropy(),
    }
}

/// One named slot. Weights are matrices, biases are vectors.
#[derive(Debug, Clone)]
pub enum ParamSlot {
    Matrix(SharedMatrix),
    Vector(SharedVector),
}

impl ParamSlot {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParamSlot::Matrix(m) => m.borrow().shape().to_vec(),
            ParamSlot::Vector(v) => v.borrow().shape().to_vec(),
        }
    }

    /// Copy of the current value in dynamic-rank form.
    pub fn to_dyn(&self) -> ArrayD<f32> {
        match self {
            ParamSlot::Matrix(m) => m.borrow().clone().into_dyn(),
            ParamSlot::Vector(v) => v.borrow().clone().into_dyn(),
        }
    }

    fn assign(&self, value: &ArrayD<f32>) {
        match self {
            ParamSlot::Matrix(m) => m.borrow_mut().view_mut().into_dyn().assign(value),
            ParamSlot::Vector(v) => v.borrow_mut().view_mut().into_dyn().assign(value),
        }
    }
}

/// Slot names present at [`ParamStore::mark`].
#[derive(Debug, Clone)]
pub(crate) struct StoreMark {
    names: BTreeSet<String>,
    created: u64,
}

/// Owner of every parameter slot plus the global step counter.
#[derive(Debug, Default)]
pub struct ParamStore {
    slots: BTreeMap<String, ParamSlot>,
    created: u64,
    global_step: u64,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the matrix slot `name` with shape `(rows, cols)`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `name` exists with a different rank or shape
    /// - `InvalidConfig` if the initializer is malformed
    pub fn matrix(
        &mut self,
        name: &str,
        shape: (usize, usize),
        init: &Initializer,
    ) -> WtaResult<SharedMatrix> {
        if let Some(slot) = self.slots.get(name) {
            return match slot {
                ParamSlot::Matrix(m) => {
                    check_shape(name, m.borrow().shape(), &[shape.0, shape.1])?;
                    Ok(Rc::clone(m))
                }
                ParamSlot::Vector(_) => Err(WtaError::shape(format!("rank of {name}"), 2, 1)),
            };
        }

        let value: Array2<f32> = init.sample(shape, self.created)?;
        let handle = Rc::new(RefCell::new(value));
        self.insert(name, ParamSlot::Matrix(Rc::clone(&handle)));
        Ok(handle)
    }

    /// Get or create the vector slot `name` with length `len`.
    ///
    /// # Errors
    /// Same as [`ParamStore::matrix`].
    pub fn vector(&mut self, name: &str, len: usize, init: &Initializer) -> WtaResult<SharedVector> {
        if let Some(slot) = self.slots.get(name) {
            return match slot {
                ParamSlot::Vector(v) => {
                    check_shape(name, v.borrow().shape(), &[len])?;
                    Ok(Rc::clone(v))
                }
                ParamSlot::Matrix(_) => Err(WtaError::shape(format!("rank of {name}"), 1, 2)),
            };
        }

        let value: Array1<f32> = init.sample(len, self.created)?;
        let handle = Rc::new(RefCell::new(value));
        self.insert(name, ParamSlot::Vector(Rc::clone(&handle)));
        Ok(handle)
    }

    fn insert(&mut self, name: &str, slot: ParamSlot) {
        debug!("created parameter {} with shape {:?}", name, slot.shape());
        self.slots.insert(name.to_string(), slot);
        self.created += 1;
    }

    pub fn get(&self, name: &str) -> Option<&ParamSlot> {
        self.slots.get(name)
    }

    fn slot(&self, name: &str) -> WtaResult<&ParamSlot> {
        self.slots
            .get(name)
            .ok_or_else(|| WtaError::UnknownParam(name.to_string()))
    }

    /// Copy of a parameter's current value.
    pub fn value(&self, name: &str) -> WtaResult<ArrayD<f32>> {
        Ok(self.slot(name)?.to_dyn())
    }

    /// Mutate a parameter in place through a dynamic-rank view.
    pub fn update<F>(&self, name: &str, f: F) -> WtaResult<()>
    where
        F: FnOnce(ArrayViewMutD<'_, f32>),
    {
        match self.slot(name)? {
            ParamSlot::Matrix(m) => f(m.borrow_mut().view_mut().into_dyn()),
            ParamSlot::Vector(v) => f(v.borrow_mut().view_mut().into_dyn()),
        }
        Ok(())
    }

    /// Slot names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Advance the step counter by one. Returns the new value.
    pub fn increment_step(&mut self) -> u64 {
        self.global_step += 1;
        self.global_step
    }

    /// Record which slots exist now, so a failed build can drop what it added.
    pub(crate) fn mark(&self) -> StoreMark {
        StoreMark {
            names: self.slots.keys().cloned().collect(),
            created: self.created,
        }
    }

    /// Remove every slot created after `mark` and rewind the creation counter.
    pub(crate) fn rollback(&mut self, mark: StoreMark) {
        let dropped = self.slots.len() - mark.names.len();
        self.slots.retain(|name, _| mark.names.contains(name));
        self.created = mark.created;
        if dropped > 0 {
            debug!("rolled back {dropped} parameter slots");
        }
    }

    /// Copy every slot into a name-keyed map.
    pub fn snapshot(&self) -> BTreeMap<String, ArrayD<f32>> {
        self.slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.to_dyn()))
            .collect()
    }

    /// Check that slot `name` exists and has exactly `shape`.
    pub fn check_value_shape(&self, name: &str, shape: &[usize]) -> WtaResult<()> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| WtaError::UnknownParam(name.to_string()))?;
        check_shape(name, shape, &slot.shape())
    }

    /// Check that `values` names exactly this store's slots with matching shapes.
    pub fn check_snapshot(&self, values: &BTreeMap<String, ArrayD<f32>>) -> WtaResult<()> {
        for (name, value) in values {
            self.check_value_shape(name, value.shape())?;
        }
        if let Some(missing) = self.slots.keys().find(|name| !values.contains_key(*name)) {
            return Err(WtaError::UnknownParam(missing.clone()));
        }
        Ok(())
    }

    /// Overwrite every slot in place and set the step counter.
    ///
    /// Handles held elsewhere stay valid and observe the new values. Nothing is
    /// written unless the whole snapshot checks out.
    pub fn restore(
        &mut self,
        values: &BTreeMap<String, ArrayD<f32>>,
        global_step: u64,
    ) -> WtaResult<()> {
        self.check_snapshot(values)?;
        for (name, slot) in &self.slots {
            if let Some(value) = values.get(name) {
                slot.assign(value);
            }
        }
        self.global_step = global_step;
        Ok(())
    }
}

fn check_shape(name: &str, actual: &[usize], expected: &[usize]) -> WtaResult<()> {
    if actual.len() != expected.len() {
        return Err(WtaError::shape(
            format!("rank of {name}"),
            expected.len(),
            actual.len(),
        ));
    }
    for (axis, (&got, &want)) in actual.iter().zip(expected).enumerate() {
        if got != want {
            return Err(WtaError::shape(format!("{name} axis {axis}"), want, got));
        }
    }
    Ok(())
}
