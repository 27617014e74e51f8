//! Explicit execution context.
//!
//! A [`Session`] owns the parameter store (values plus `global_step`) and the
//! optimizer that updates it. Callers create one, build models into it and pass
//! it to every model operation; there is no process-wide default session.
//!
//! Sessions are neither `Send` nor `Sync` (parameters are `Rc<RefCell<_>>`),
//! and training steps take `&mut Session`, so access is serialized per session.

use crate::core::{WtaError, WtaResult};
use crate::optim::{Gradients, Optimizer, OptimizerKind, OptimizerState};
use crate::params::ParamStore;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Session {
    id: u64,
    store: ParamStore,
    optimizer: Option<Box<dyn Optimizer>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            store: ParamStore::new(),
            optimizer: None,
        }
    }

    /// Unique id, used to check that a model is driven by its own session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    pub fn global_step(&self) -> u64 {
        self.store.global_step()
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    /// Check that a model asking for `kind` at `learning_rate` can share this
    /// session's optimizer.
    ///
    /// A second model built into the same session must ask for the same rule
    /// and learning rate, since one optimizer updates the whole store.
    pub(crate) fn check_optimizer(&self, kind: OptimizerKind, learning_rate: f32) -> WtaResult<()> {
        match &self.optimizer {
            Some(existing)
                if existing.kind() != kind || existing.learning_rate() != learning_rate =>
            {
                Err(WtaError::InvalidConfig(format!(
                    "session already trains with {} (lr {}), cannot switch to {} (lr {})",
                    existing.kind(),
                    existing.learning_rate(),
                    kind,
                    learning_rate
                )))
            }
            _ => Ok(()),
        }
    }

    /// Install the session's optimizer, keeping an existing compatible one.
    pub(crate) fn install_optimizer(&mut self, optimizer: Box<dyn Optimizer>) -> WtaResult<()> {
        self.check_optimizer(optimizer.kind(), optimizer.learning_rate())?;
        if self.optimizer.is_none() {
            self.optimizer = Some(optimizer);
        }
        Ok(())
    }

    /// Apply one optimizer update and advance `global_step` by exactly one.
    ///
    /// Returns the new step count.
    pub fn apply_gradients(&mut self, grads: &Gradients) -> WtaResult<u64> {
        let optimizer = self.optimizer.as_mut().ok_or_else(|| {
            WtaError::InvalidConfig("session has no optimizer; build a model first".to_string())
        })?;
        optimizer.apply(&self.store, grads)?;
        let step = self.store.increment_step();
        debug!("applied {} gradients, global_step={}", grads.len(), step);
        Ok(step)
    }

    pub fn optimizer_state(&self) -> Option<OptimizerState> {
        self.optimizer.as_ref().map(|opt| opt.export_state())
    }

    pub(crate) fn optimizer_mut(&mut self) -> Option<&mut (dyn Optimizer + 'static)> {
        self.optimizer.as_deref_mut()
    }
}
