//! Gradient containers and update rules.
//!
//! An [`Optimizer`] receives the [`Gradients`] of the loss with respect to every
//! parameter that took part in a step and writes the update into the
//! [`ParamStore`] in place. Bumping `global_step` is the session's job, so a
//! rule never has to know about the counter.
//!
//! Supported rules, selected by [`OptimizerKind`]:
//!
//! ```text
//! gradient_descent   w -= lr * g
//! momentum           v = mu * v + g;  w -= lr * v
//! adam               m = b1 * m + (1 - b1) * g
//!                    v = b2 * v + (1 - b2) * g^2
//!                    w -= lr * sqrt(1 - b2^t) / (1 - b1^t) * m / (sqrt(v) + eps)
//! ```

use crate::core::{WtaError, WtaResult};
use crate::params::ParamStore;
use ndarray::{ArrayD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Loss gradients keyed by parameter name.
///
/// Contributions for the same name are summed, which is how the tied decoder
/// and the final encoder layer combine their gradients on the shared matrix.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: BTreeMap<String, ArrayD<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` to the running gradient of `name`.
    pub fn accumulate(&mut self, name: &str, grad: ArrayD<f32>) -> WtaResult<()> {
        match self.grads.get_mut(name) {
            Some(acc) => {
                if acc.shape() != grad.shape() {
                    return Err(WtaError::shape(
                        format!("gradient size of {name}"),
                        acc.len(),
                        grad.len(),
                    ));
                }
                *acc += &grad;
            }
            None => {
                self.grads.insert(name.to_string(), grad);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.grads.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.grads.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// Name of a supported update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    GradientDescent,
    Momentum,
    Adam,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::GradientDescent => "gradient_descent",
            OptimizerKind::Momentum => "momentum",
            OptimizerKind::Adam => "adam",
        };
        f.write_str(name)
    }
}

impl FromStr for OptimizerKind {
    type Err = WtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" | "gd" | "gradient_descent" | "gradientdescent" => {
                Ok(OptimizerKind::GradientDescent)
            }
            "momentum" => Ok(OptimizerKind::Momentum),
            "adam" => Ok(OptimizerKind::Adam),
            _ => Err(WtaError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl OptimizerKind {
    /// Suffixes appended to a parameter name to key this rule's slot tensors.
    fn slot_suffixes(self) -> &'static [&'static str] {
        match self {
            OptimizerKind::GradientDescent => &[],
            OptimizerKind::Momentum => &[":velocity"],
            OptimizerKind::Adam => &[":m", ":v"],
        }
    }
}

/// Persistable optimizer state (slot tensors and the rule's own step count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub learning_rate: f32,
    pub updates: u64,
    pub slots: BTreeMap<String, ArrayD<f32>>,
}

impl OptimizerState {
    /// Check every slot against the parameter it belongs to.
    ///
    /// # Errors
    /// - `UnknownParam` if a key has no suffix of this rule or names a missing parameter
    /// - `ShapeMismatch` if a slot's shape differs from its parameter's
    pub fn check_slots(&self, store: &ParamStore) -> WtaResult<()> {
        for (key, value) in &self.slots {
            let name = self
                .kind
                .slot_suffixes()
                .iter()
                .find_map(|suffix| key.strip_suffix(suffix))
                .ok_or_else(|| WtaError::UnknownParam(key.clone()))?;
            store.check_value_shape(name, value.shape())?;
        }
        Ok(())
    }
}

/// A gradient-based update rule.
pub trait Optimizer: fmt::Debug {
    fn kind(&self) -> OptimizerKind;

    fn learning_rate(&self) -> f32;

    /// Apply one update to every parameter named in `grads`.
    ///
    /// # Errors
    /// `UnknownParam` if a gradient names a slot the store does not hold.
    fn apply(&mut self, store: &ParamStore, grads: &Gradients) -> WtaResult<()>;

    /// Snapshot of slot tensors for checkpointing.
    fn export_state(&self) -> OptimizerState;

    /// Replace slot tensors with a previously exported state.
    fn import_state(&mut self, state: &OptimizerState) -> WtaResult<()>;
}

/// Construct the rule named by `kind`.
pub fn build_optimizer(kind: OptimizerKind, learning_rate: f32) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::GradientDescent => Box::new(GradientDescent::new(learning_rate)),
        OptimizerKind::Momentum => Box::new(Momentum::new(learning_rate, 0.9)),
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
    }
}

fn check_kind(expected: OptimizerKind, state: &OptimizerState) -> WtaResult<()> {
    if state.kind != expected {
        return Err(WtaError::InvalidConfig(format!(
            "optimizer state is for {}, not {}",
            state.kind, expected
        )));
    }
    Ok(())
}

fn require_grad_slots(store: &ParamStore, grads: &Gradients) -> WtaResult<()> {
    match grads.iter().find(|(name, _)| store.get(name).is_none()) {
        Some((name, _)) => Err(WtaError::UnknownParam(name.to_string())),
        None => Ok(()),
    }
}

/// Plain gradient descent.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    learning_rate: f32,
    updates: u64,
}

impl GradientDescent {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            updates: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::GradientDescent
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn apply(&mut self, store: &ParamStore, grads: &Gradients) -> WtaResult<()> {
        require_grad_slots(store, grads)?;
        let lr = self.learning_rate;
        for (name, grad) in grads.iter() {
            store.update(name, |mut param| param.scaled_add(-lr, grad))?;
        }
        self.updates += 1;
        Ok(())
    }

    fn export_state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind(),
            learning_rate: self.learning_rate,
            updates: self.updates,
            slots: BTreeMap::new(),
        }
    }

    fn import_state(&mut self, state: &OptimizerState) -> WtaResult<()> {
        check_kind(self.kind(), state)?;
        self.updates = state.updates;
        Ok(())
    }
}

/// Gradient descent with a velocity accumulator.
#[derive(Debug, Clone)]
pub struct Momentum {
    learning_rate: f32,
    momentum: f32,
    updates: u64,
    velocity: BTreeMap<String, ArrayD<f32>>,
}

impl Momentum {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            updates: 0,
            velocity: BTreeMap::new(),
        }
    }
}

impl Optimizer for Momentum {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Momentum
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn apply(&mut self, store: &ParamStore, grads: &Gradients) -> WtaResult<()> {
        require_grad_slots(store, grads)?;
        let (lr, mu) = (self.learning_rate, self.momentum);
        for (name, grad) in grads.iter() {
            let velocity = self
                .velocity
                .entry(name.to_string())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            velocity.zip_mut_with(grad, |v, &g| *v = mu * *v + g);
            store.update(name, |mut param| param.scaled_add(-lr, &*velocity))?;
        }
        self.updates += 1;
        Ok(())
    }

    fn export_state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind(),
            learning_rate: self.learning_rate,
            updates: self.updates,
            slots: self
                .velocity
                .iter()
                .map(|(name, v)| (format!("{name}:velocity"), v.clone()))
                .collect(),
        }
    }

    fn import_state(&mut self, state: &OptimizerState) -> WtaResult<()> {
        check_kind(self.kind(), state)?;
        let mut velocity = BTreeMap::new();
        for (key, value) in &state.slots {
            let name = key
                .strip_suffix(":velocity")
                .ok_or_else(|| WtaError::UnknownParam(key.clone()))?;
            velocity.insert(name.to_string(), value.clone());
        }
        self.velocity = velocity;
        self.updates = state.updates;
        Ok(())
    }
}

/// Adam with bias-corrected step size.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    updates: u64,
    first_moment: BTreeMap<String, ArrayD<f32>>,
    second_moment: BTreeMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            updates: 0,
            first_moment: BTreeMap::new(),
            second_moment: BTreeMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adam
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    #[allow(clippy::cast_precision_loss)]
    fn apply(&mut self, store: &ParamStore, grads: &Gradients) -> WtaResult<()> {
        require_grad_slots(store, grads)?;

        self.updates += 1;
        let t = self.updates as f64;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = (f64::from(self.learning_rate) * (1.0 - f64::from(beta2).powf(t)).sqrt()
            / (1.0 - f64::from(beta1).powf(t))) as f32;

        for (name, grad) in grads.iter() {
            let m = self
                .first_moment
                .entry(name.to_string())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let v = self
                .second_moment
                .entry(name.to_string())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));

            m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            store.update(name, |param| adam_step(param, m, v, lr_t, eps))?;
        }
        Ok(())
    }

    fn export_state(&self) -> OptimizerState {
        let first = self
            .first_moment
            .iter()
            .map(|(name, m)| (format!("{name}:m"), m.clone()));
        let second = self
            .second_moment
            .iter()
            .map(|(name, v)| (format!("{name}:v"), v.clone()));
        OptimizerState {
            kind: self.kind(),
            learning_rate: self.learning_rate,
            updates: self.updates,
            slots: first.chain(second).collect(),
        }
    }

    fn import_state(&mut self, state: &OptimizerState) -> WtaResult<()> {
        check_kind(self.kind(), state)?;
        let mut first = BTreeMap::new();
        let mut second = BTreeMap::new();
        for (key, value) in &state.slots {
            if let Some(name) = key.strip_suffix(":m") {
                first.insert(name.to_string(), value.clone());
            } else if let Some(name) = key.strip_suffix(":v") {
                second.insert(name.to_string(), value.clone());
            } else {
                return Err(WtaError::UnknownParam(key.clone()));
            }
        }
        self.first_moment = first;
        self.second_moment = second;
        self.updates = state.updates;
        Ok(())
    }
}

fn adam_step(param: ArrayViewMutD<'_, f32>, m: &ArrayD<f32>, v: &ArrayD<f32>, lr_t: f32, eps: f32) {
    Zip::from(param).and(m).and(v).for_each(|p, &m, &v| {
        *p -= lr_t * m / (v.sqrt() + eps);
    });
}
