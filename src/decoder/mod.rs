//! Decoder: a single affine layer from sparse code back to input space.
//!
//! Two variants, chosen at build time:
//! - **Tied**: `W = encode_W_lastᵀ`. The decoder holds a clone of the final
//!   encoder layer's handle and reads it transposed; only `decode_b` is its own.
//! - **Untied**: `decode_W` with shape `[hidden_units, input_dim]` is an
//!   independent parameter.
//!
//! The same decoder serves the training graph and dictionary extraction, so
//! both always see the same weight values.

use crate::core::WtaResult;
use crate::encoder::DenseLayer;
use crate::optim::Gradients;
use crate::params::{ParamStore, SharedMatrix, SharedVector};
use crate::ModelConfig;
use ndarray::{Array2, ArrayView2, Axis};
use std::rc::Rc;

/// Where the decode matrix comes from.
#[derive(Debug, Clone)]
pub enum DecodeWeights {
    /// Transposed view of an encoder matrix, shape `[input_dim, hidden_units]`
    Tied { name: String, handle: SharedMatrix },
    /// Own matrix, shape `[hidden_units, input_dim]`
    Untied { name: String, handle: SharedMatrix },
}

impl DecodeWeights {
    pub fn name(&self) -> &str {
        match self {
            DecodeWeights::Tied { name, .. } | DecodeWeights::Untied { name, .. } => name,
        }
    }

    pub fn is_tied(&self) -> bool {
        matches!(self, DecodeWeights::Tied { .. })
    }

    /// Effective decode matrix `[hidden_units, input_dim]` as an owned copy.
    pub fn matrix(&self) -> Array2<f32> {
        match self {
            DecodeWeights::Tied { handle, .. } => handle.borrow().t().to_owned(),
            DecodeWeights::Untied { handle, .. } => handle.borrow().clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    weights: DecodeWeights,
    bias_name: String,
    bias: SharedVector,
}

impl Decoder {
    /// Create `decode_b` (and `decode_W` when untied) in `store`.
    pub fn build(
        store: &mut ParamStore,
        config: &ModelConfig,
        last_encoder: &DenseLayer,
    ) -> WtaResult<Self> {
        let bias_name = config.param_name("decode_b");
        let bias = store.vector(&bias_name, config.input_dim, &config.bias_initializer)?;

        let weights = if config.tie_weights {
            DecodeWeights::Tied {
                name: last_encoder.weight_name().to_string(),
                handle: Rc::clone(last_encoder.weights()),
            }
        } else {
            let name = config.param_name("decode_W");
            let handle = store.matrix(
                &name,
                (config.hidden_units, config.input_dim),
                &config.weight_initializer,
            )?;
            DecodeWeights::Untied { name, handle }
        };

        Ok(Self {
            weights,
            bias_name,
            bias,
        })
    }

    pub fn weights(&self) -> &DecodeWeights {
        &self.weights
    }

    /// `code W + b`
    pub fn decode(&self, code: ArrayView2<'_, f32>) -> Array2<f32> {
        let projected = match &self.weights {
            DecodeWeights::Tied { handle, .. } => code.dot(&handle.borrow().t()),
            DecodeWeights::Untied { handle, .. } => code.dot(&*handle.borrow()),
        };
        projected + &*self.bias.borrow()
    }

    /// Accumulate decoder gradients and return dLoss/d code.
    ///
    /// In tied mode the weight gradient `(codeᵀ · d_out)ᵀ` is added to the
    /// encoder matrix's entry, so it sums with the encoder's own contribution.
    pub fn backward(
        &self,
        code: &Array2<f32>,
        d_output: &Array2<f32>,
        grads: &mut Gradients,
    ) -> WtaResult<Array2<f32>> {
        grads.accumulate(&self.bias_name, d_output.sum_axis(Axis(0)).into_dyn())?;

        let d_code = match &self.weights {
            DecodeWeights::Tied { name, handle } => {
                grads.accumulate(name, d_output.t().dot(code).into_dyn())?;
                d_output.dot(&*handle.borrow())
            }
            DecodeWeights::Untied { name, handle } => {
                grads.accumulate(name, code.t().dot(d_output).into_dyn())?;
                d_output.dot(&handle.borrow().t())
            }
        };
        Ok(d_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderStack;
    use crate::params::Initializer;
    use ndarray::array;

    fn build(tie: bool) -> (ParamStore, EncoderStack, Decoder) {
        let mut store = ParamStore::new();
        let config = ModelConfig {
            hidden_units: 2,
            encode_layers: 1,
            tie_weights: tie,
            bias_initializer: Initializer::Zeros,
            ..ModelConfig::new(3, 4)
        };
        let encoder = EncoderStack::build(&mut store, &config).unwrap();
        let decoder = Decoder::build(&mut store, &config, encoder.last_layer()).unwrap();
        (store, encoder, decoder)
    }

    #[test]
    fn test_tied_decoder_shares_encoder_storage() {
        let (store, encoder, decoder) = build(true);
        assert!(decoder.weights().is_tied());
        assert!(store.get("FCWTA/decode_W").is_none());
        assert_eq!(store.len(), 3);

        *encoder.last_layer().weights().borrow_mut() =
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        assert_eq!(
            decoder.weights().matrix(),
            array![[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]
        );
        let out = decoder.decode(array![[1.0, 0.0], [0.0, 2.0]].view());
        assert_eq!(out, array![[1.0, 3.0, 5.0], [4.0, 8.0, 12.0]]);
    }

    #[test]
    fn test_untied_decoder_owns_matrix() {
        let (store, encoder, decoder) = build(false);
        assert!(!decoder.weights().is_tied());
        assert_eq!(store.get("FCWTA/decode_W").unwrap().shape(), vec![2, 3]);

        let before = decoder.weights().matrix();
        encoder.last_layer().weights().borrow_mut().fill(7.0);
        assert_eq!(decoder.weights().matrix(), before);
    }

    #[test]
    fn test_tied_backward_targets_encoder_matrix() {
        let (_store, _encoder, decoder) = build(true);
        let code = array![[1.0, 0.0], [0.0, 2.0], [0.5, 0.5], [0.0, 0.0]];
        let d_out = Array2::ones((4, 3));
        let mut grads = Gradients::new();
        let d_code = decoder.backward(&code, &d_out, &mut grads).unwrap();

        assert_eq!(d_code.dim(), (4, 2));
        let gw = grads.get("FCWTA/encode_W_0").unwrap();
        assert_eq!(gw.shape(), &[3, 2]);
        // Every output column sees the column sums of the code.
        assert_eq!(gw[[0, 0]], 1.5);
        assert_eq!(gw[[2, 1]], 2.5);
        assert_eq!(grads.get("FCWTA/decode_b").unwrap()[[0]], 4.0);
        assert!(grads.get("FCWTA/decode_W").is_none());
    }

    #[test]
    fn test_untied_backward_shapes() {
        let (_store, _encoder, decoder) = build(false);
        let code = Array2::ones((4, 2));
        let d_out = Array2::ones((4, 3));
        let mut grads = Gradients::new();
        decoder.backward(&code, &d_out, &mut grads).unwrap();
        assert_eq!(grads.get("FCWTA/decode_W").unwrap().shape(), &[2, 3]);
        assert!(grads.get("FCWTA/encode_W_0").is_none());
    }
}
