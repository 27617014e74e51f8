//! Encoder stack: sequential affine + ReLU layers.
//!
//! ```text
//! input [batch, input_dim]
//!   -> relu(x W_0 + b_0)            [batch, input_dim]    (encode_layers - 1 times)
//!   -> relu(x W_last + b_last)      [batch, hidden_units]
//! ```
//!
//! [`EncoderStack::forward`] keeps each layer's input in an [`EncoderTrace`] so [`EncoderStack::backward`] can push the loss gradient
//! back through the stack without recomputing anything.

use crate::core::{Activation, ReluActivation, WtaError, WtaResult};
use crate::optim::Gradients;
use crate::params::{ParamStore, SharedMatrix, SharedVector};
use crate::ModelConfig;
use ndarray::{Array2, ArrayView2, Axis};

/// One affine layer whose weight and bias live in a [`ParamStore`].
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weight_name: String,
    bias_name: String,
    weights: SharedMatrix,
    bias: SharedVector,
}

impl DenseLayer {
    /// Fetch (or create) `encode_W_{index}` / `encode_b_{index}` in `store`.
    pub fn build(
        store: &mut ParamStore,
        config: &ModelConfig,
        index: usize,
        in_dim: usize,
        out_dim: usize,
    ) -> WtaResult<Self> {
        let weight_name = config.param_name(&format!("encode_W_{index}"));
        let bias_name = config.param_name(&format!("encode_b_{index}"));
        let weights = store.matrix(&weight_name, (in_dim, out_dim), &config.weight_initializer)?;
        let bias = store.vector(&bias_name, out_dim, &config.bias_initializer)?;
        Ok(Self {
            weight_name,
            bias_name,
            weights,
            bias,
        })
    }

    /// `x W + b`
    pub fn affine(&self, input: ArrayView2<'_, f32>) -> Array2<f32> {
        input.dot(&*self.weights.borrow()) + &*self.bias.borrow()
    }

    pub fn weights(&self) -> &SharedMatrix {
        &self.weights
    }

    pub fn weight_name(&self) -> &str {
        &self.weight_name
    }

    pub fn bias_name(&self) -> &str {
        &self.bias_name
    }

    pub fn dims(&self) -> (usize, usize) {
        self.weights.borrow().dim()
    }
}

/// Layer inputs and the final code from one forward pass.
///
/// The activated output of layer `i` is the input of layer `i + 1`, so only the
/// inputs and the last output are kept.
#[derive(Debug, Clone)]
pub struct EncoderTrace {
    inputs: Vec<Array2<f32>>,
    code: Array2<f32>,
}

impl EncoderTrace {
    /// Output of the final layer (the pre-mask code).
    pub fn output(&self) -> &Array2<f32> {
        &self.code
    }

    pub fn into_output(self) -> Array2<f32> {
        self.code
    }

    fn layer_output(&self, i: usize) -> &Array2<f32> {
        self.inputs.get(i + 1).unwrap_or(&self.code)
    }
}

/// Stack of `encode_layers` dense layers, each followed by the activation.
#[derive(Debug)]
pub struct EncoderStack {
    hidden: Vec<DenseLayer>,
    code_layer: DenseLayer,
    activation: Box<dyn Activation>,
}

impl EncoderStack {
    /// Build the layers described by `config`.
    ///
    /// # Errors
    /// - `InvalidConfig` if `encode_layers` is zero
    /// - any error from creating the parameter slots
    pub fn build(store: &mut ParamStore, config: &ModelConfig) -> WtaResult<Self> {
        if config.encode_layers == 0 {
            return Err(WtaError::InvalidConfig(
                "encode_layers must be >= 1".to_string(),
            ));
        }

        let last = config.encode_layers - 1;
        let hidden = (0..last)
            .map(|i| DenseLayer::build(store, config, i, config.input_dim, config.input_dim))
            .collect::<WtaResult<Vec<_>>>()?;
        let code_layer =
            DenseLayer::build(store, config, last, config.input_dim, config.hidden_units)?;

        Ok(Self {
            hidden,
            code_layer,
            activation: Box::new(ReluActivation),
        })
    }

    /// All layers, input side first.
    pub fn layers(&self) -> impl Iterator<Item = &DenseLayer> {
        self.hidden.iter().chain(std::iter::once(&self.code_layer))
    }

    /// The layer whose weights a tied decoder reuses.
    pub fn last_layer(&self) -> &DenseLayer {
        &self.code_layer
    }

    /// Run every layer and keep the intermediate values.
    pub fn forward(&self, input: ArrayView2<'_, f32>) -> EncoderTrace {
        let mut inputs = Vec::with_capacity(self.hidden.len() + 1);
        let mut current = input.to_owned();
        for layer in self.layers() {
            let next = self.activation.apply(&layer.affine(current.view()));
            inputs.push(current);
            current = next;
        }
        EncoderTrace {
            inputs,
            code: current,
        }
    }

    /// Forward pass without the trace.
    pub fn encode(&self, input: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut current = input.to_owned();
        for layer in self.layers() {
            current = self.activation.apply(&layer.affine(current.view()));
        }
        current
    }

    /// Backpropagate `d_output` (dLoss/d code) through the stack.
    ///
    /// For each layer, from last to first:
    /// ```text
    /// dZ      = dA ⊙ f'(A)
    /// dW     += X^T dZ
    /// db     += Σ_rows dZ
    /// dA_prev = dZ W^T
    /// ```
    ///
    /// Returns dLoss/d input.
    pub fn backward(
        &self,
        trace: &EncoderTrace,
        d_output: Array2<f32>,
        grads: &mut Gradients,
    ) -> WtaResult<Array2<f32>> {
        let layers: Vec<&DenseLayer> = self.layers().collect();
        let mut d_act = d_output;
        for (i, layer) in layers.into_iter().enumerate().rev() {
            let d_z = d_act * &self.activation.derivative_from_output(trace.layer_output(i));
            grads.accumulate(layer.weight_name(), trace.inputs[i].t().dot(&d_z).into_dyn())?;
            grads.accumulate(layer.bias_name(), d_z.sum_axis(Axis(0)).into_dyn())?;
            d_act = d_z.dot(&layer.weights.borrow().t());
        }
        Ok(d_act)
    }
}
