//! Model facade: one training/inference step, encoding and dictionary extraction.
//!
//! A [`WtaModel`] is built into a [`Session`] and is ready from then on; a
//! failed build never hands out a partial model. Every operation takes the
//! session explicitly and rejects any session other than the one the model
//! was built in.
//!
//! ## Training step
//!
//! ```text
//! encoded  = encoder(input)                       [batch, hidden]
//! mask     = lifetime_mask(encoded, k)            [hidden, batch]
//! sparse   = encoded ⊙ maskᵀ
//! decoded  = decoder(sparse)                      [batch, input_dim]
//! loss     = Σ (decoded - input)²
//! ```
//!
//! Backward runs the same graph in reverse; the mask gates the gradient exactly
//! as it gated the code, so only winning activations learn.

use crate::checkpoint::Checkpoint;
use crate::core::{WtaError, WtaResult};
use crate::decoder::Decoder;
use crate::encoder::EncoderStack;
use crate::loss::{sum_squared_error, sum_squared_error_grad};
use crate::optim::{build_optimizer, Gradients};
use crate::session::Session;
use crate::sparsity::{apply_mask, lifetime_mask};
use crate::ModelConfig;
use log::{debug, info, warn};
use ndarray::Array2;

/// Scale of the one-hot probe used by [`WtaModel::dictionary`].
pub const DICTIONARY_PROBE_SCALE: f32 = 1e15;

/// Result of [`WtaModel::step`].
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Reconstruction `[batch_size, input_dim]`
    pub decoded: Array2<f32>,
    /// Summed squared reconstruction error
    pub loss: f32,
}

/// Fully-connected winner-take-all autoencoder.
#[derive(Debug)]
pub struct WtaModel {
    config: ModelConfig,
    k: usize,
    session_id: u64,
    encoder: EncoderStack,
    decoder: Decoder,
}

impl WtaModel {
    /// Validate `config`, create every parameter in `session` and return a
    /// ready model.
    ///
    /// # Errors
    /// - `InvalidConfig` for any invalid field, including `k` outside `1..=batch_size`
    /// - `InvalidConfig` if the session's optimizer uses another rule or learning rate
    /// - `ShapeMismatch` if the session already holds a same-named slot of another shape
    ///
    /// On error the session is left as it was.
    pub fn build(config: ModelConfig, session: &mut Session) -> WtaResult<Self> {
        let k = config.validate()?;
        session.check_optimizer(config.optimizer, config.learning_rate)?;

        let store = session.store_mut();
        let mark = store.mark();
        let layers = EncoderStack::build(store, &config).and_then(|encoder| {
            let decoder = Decoder::build(store, &config, encoder.last_layer())?;
            Ok((encoder, decoder))
        });
        let (encoder, decoder) = match layers {
            Ok(layers) => layers,
            Err(e) => {
                store.rollback(mark);
                return Err(e);
            }
        };
        session.install_optimizer(build_optimizer(config.optimizer, config.learning_rate))?;

        info!(
            "built {}: input_dim={}, hidden_units={}, encode_layers={}, batch_size={}, k={}, tied={}, optimizer={}",
            config.name,
            config.input_dim,
            config.hidden_units,
            config.encode_layers,
            config.batch_size,
            k,
            config.tie_weights,
            config.optimizer
        );

        Ok(Self {
            config,
            k,
            session_id: session.id(),
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Winners per hidden unit.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn encoder(&self) -> &EncoderStack {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn global_step(&self, session: &Session) -> WtaResult<u64> {
        self.check_session(session)?;
        Ok(session.global_step())
    }

    /// Run one step on a full batch, returning `(decoded, loss)`.
    ///
    /// With `forward_only` the parameters and `global_step` are left untouched.
    /// Otherwise gradients of the loss update every parameter once and
    /// `global_step` advances by one. The returned values are those computed
    /// before the update in both modes.
    ///
    /// # Errors
    /// `ShapeMismatch` if `input` is not `[batch_size, input_dim]`; the model
    /// state is unchanged.
    pub fn step(
        &self,
        session: &mut Session,
        input: &Array2<f32>,
        forward_only: bool,
    ) -> WtaResult<StepOutput> {
        self.check_session(session)?;
        self.check_batch(input)?;

        let trace = self.encoder.forward(input.view());
        let mask = lifetime_mask(trace.output().view(), self.k)?;
        let sparse = apply_mask(trace.output().view(), &mask)?;
        let decoded = self.decoder.decode(sparse.view());
        let loss = sum_squared_error(&decoded, input);

        if forward_only {
            debug!("forward-only step: loss={loss}");
        } else {
            let mut grads = Gradients::new();
            let d_decoded = sum_squared_error_grad(&decoded, input);
            let d_sparse = self.decoder.backward(&sparse, &d_decoded, &mut grads)?;
            let d_encoded = apply_mask(d_sparse.view(), &mask)?;
            self.encoder.backward(&trace, d_encoded, &mut grads)?;
            let step = session.apply_gradients(&grads)?;
            debug!("training step {step}: loss={loss}");
        }

        Ok(StepOutput { decoded, loss })
    }

    /// Raw pre-mask code `[rows, hidden_units]`.
    ///
    /// Any number of rows is accepted, since no mask is computed.
    ///
    /// # Errors
    /// `ShapeMismatch` if `input` does not have `input_dim` columns.
    pub fn encode(&self, session: &Session, input: &Array2<f32>) -> WtaResult<Array2<f32>> {
        self.check_session(session)?;
        self.check_columns(input)?;
        Ok(self.encoder.encode(input.view()))
    }

    /// Masked code `[batch_size, hidden_units]` for a full batch.
    pub fn sparse_code(&self, session: &Session, input: &Array2<f32>) -> WtaResult<Array2<f32>> {
        self.check_session(session)?;
        self.check_batch(input)?;
        let encoded = self.encoder.encode(input.view());
        let mask = lifetime_mask(encoded.view(), self.k)?;
        apply_mask(encoded.view(), &mask)
    }

    /// Approximate dictionary `[hidden_units, input_dim]`.
    ///
    /// Decodes the saturated probe `1e15 · I(hidden_units)` through the decoder
    /// alone, so row `j` is dominated by the decode weights of unit `j`.
    pub fn dictionary(&self, session: &Session) -> WtaResult<Array2<f32>> {
        self.check_session(session)?;
        let probe = Array2::<f32>::eye(self.config.hidden_units) * DICTIONARY_PROBE_SCALE;
        Ok(self.decoder.decode(probe.view()))
    }

    /// Load parameters, `global_step` and optimizer slots from `checkpoint`.
    ///
    /// Values are written in place, so the tied decoder keeps sharing the final
    /// encoder matrix. Nothing changes unless the checkpoint fits this model.
    ///
    /// # Errors
    /// - `InvalidConfig` if the checkpoint describes a different architecture
    /// - `UnknownParam` / `ShapeMismatch` if its parameters or optimizer slots
    ///   do not fit the session
    pub fn restore(&self, session: &mut Session, checkpoint: &Checkpoint) -> WtaResult<()> {
        self.check_session(session)?;
        checkpoint.check_compatible(&self.config)?;
        session.store().check_snapshot(&checkpoint.params)?;
        if let Some(state) = &checkpoint.optimizer {
            state.check_slots(session.store())?;
        }

        if let (Some(state), Some(optimizer)) = (&checkpoint.optimizer, session.optimizer_mut()) {
            if state.kind == optimizer.kind() {
                optimizer.import_state(state)?;
            } else {
                warn!(
                    "checkpoint optimizer {} differs from {}, starting with fresh optimizer state",
                    state.kind,
                    optimizer.kind()
                );
            }
        }

        session
            .store_mut()
            .restore(&checkpoint.params, checkpoint.global_step)?;
        info!(
            "restored {} at global_step={}",
            self.config.name, checkpoint.global_step
        );
        Ok(())
    }

    pub(crate) fn check_session(&self, session: &Session) -> WtaResult<()> {
        if session.id() != self.session_id {
            return Err(WtaError::SessionMismatch {
                expected: self.session_id,
                got: session.id(),
            });
        }
        Ok(())
    }

    fn check_batch(&self, input: &Array2<f32>) -> WtaResult<()> {
        if input.nrows() != self.config.batch_size {
            return Err(WtaError::shape(
                "input rows (batch_size)",
                self.config.batch_size,
                input.nrows(),
            ));
        }
        self.check_columns(input)
    }

    fn check_columns(&self, input: &Array2<f32>) -> WtaResult<()> {
        if input.ncols() != self.config.input_dim {
            return Err(WtaError::shape(
                "input columns (input_dim)",
                self.config.input_dim,
                input.ncols(),
            ));
        }
        Ok(())
    }
}
