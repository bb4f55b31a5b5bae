//! Fully connected layer.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::Real;
use crate::error::{NnError, Result};
use crate::functions::{Context, Function, FunctionId, check_gradient};
use crate::ops::cpu;
use crate::tensors::{BatchArray, WithGrad, volume};

/// Computes `y = x Wᵀ + b` for every batch entry.
///
/// The weight has shape `[output, input]`, the bias `[output]`. Each input
/// entry is read as a flat vector, so its volume must equal `input`; the
/// output entries have shape `[output]`.
#[derive(Debug)]
pub struct Linear {
    name: String,
    id: FunctionId,
    input: usize,
    output: usize,
    weight: WithGrad<BatchArray>,
    bias: Option<WithGrad<BatchArray>>,
}

impl Linear {
    /// A layer with weights drawn from `N(0, 1/input)` and a zero bias.
    pub fn new(name: impl Into<String>, input: usize, output: usize, no_bias: bool) -> Self {
        Self::with_rng(name, input, output, no_bias, &mut rand::rng())
    }

    /// Same as [`Linear::new`], drawing the weights from `rng`.
    ///
    /// # Panics
    /// Panics if `input * output` overflows `usize`.
    pub fn with_rng<R: Rng>(
        name: impl Into<String>,
        input: usize,
        output: usize,
        no_bias: bool,
        rng: &mut R,
    ) -> Self {
        let Some(count) = input.checked_mul(output) else {
            panic!("a {output}x{input} weight matrix does not fit in memory");
        };
        let scale = if input == 0 {
            0.0
        } else {
            (1.0 / input as Real).sqrt()
        };
        let weights = (0..count)
            .map(|_| rng.sample::<Real, _>(StandardNormal) * scale)
            .collect();
        let bias = (!no_bias).then(|| vec![0.0; output]);

        Self::build(name.into(), input, output, weights, bias)
    }

    /// A layer with the given row-major `[output, input]` weights and optional bias.
    ///
    /// # Errors
    /// Returns [`NnError::ShapeMismatch`] if a buffer has the wrong length.
    pub fn with_weights(
        name: impl Into<String>,
        input: usize,
        output: usize,
        weights: Vec<Real>,
        bias: Option<Vec<Real>>,
    ) -> Result<Self> {
        let expected = volume(&[output, input]).unwrap_or(usize::MAX);
        if weights.len() != expected {
            return Err(NnError::ShapeMismatch {
                expected,
                got: weights.len(),
            });
        }
        if let Some(b) = &bias {
            if b.len() != output {
                return Err(NnError::ShapeMismatch {
                    expected: output,
                    got: b.len(),
                });
            }
        }
        Ok(Self::build(name.into(), input, output, weights, bias))
    }

    // lengths already checked
    fn build(
        name: String,
        input: usize,
        output: usize,
        weights: Vec<Real>,
        bias: Option<Vec<Real>>,
    ) -> Self {
        let weight = WithGrad::new(BatchArray::from_parts(weights, vec![output, input], 1));
        let bias = bias.map(|b| WithGrad::new(BatchArray::from_vec(b)));

        Self {
            name,
            id: FunctionId::next(),
            input,
            output,
            weight,
            bias,
        }
    }

    /// Input width.
    pub fn input_size(&self) -> usize {
        self.input
    }

    /// Output width.
    pub fn output_size(&self) -> usize {
        self.output
    }

    /// The weight and its gradient.
    pub fn weight(&self) -> &WithGrad<BatchArray> {
        &self.weight
    }

    /// The bias and its gradient, if the layer has one.
    pub fn bias(&self) -> Option<&WithGrad<BatchArray>> {
        self.bias.as_ref()
    }
}

impl Function for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn forward(&self, x: &BatchArray) -> Result<(BatchArray, Context)> {
        if x.volume() != self.input {
            return Err(NnError::DimensionMismatch {
                expected: vec![self.input],
                got: x.shape().to_vec(),
            });
        }

        let y = cpu::linear_forward(
            x.data(),
            self.weight.value.data(),
            self.bias.as_ref().map(|b| b.value.data()),
            self.input,
            self.output,
        );
        let y = BatchArray::convert(y, &[self.output], x.batch_count())?;
        Ok((y, Context::new(self.id, x.clone())))
    }

    fn backward(&mut self, gy: &BatchArray, ctx: Context) -> Result<BatchArray> {
        let x = ctx.claim(self.id)?;
        check_gradient(gy, &[self.output], x.batch_count())?;

        cpu::linear_weight_grad(
            gy.data(),
            x.data(),
            self.weight.grad.data_mut(),
            self.input,
            self.output,
        );
        if let Some(b) = self.bias.as_mut() {
            cpu::linear_bias_grad(gy.data(), b.grad.data_mut(), self.output);
        }

        let gx = cpu::linear_input_grad(gy.data(), self.weight.value.data(), self.input, self.output);
        BatchArray::convert(gx, x.shape(), x.batch_count())
    }

    fn parameters(&self) -> Vec<&WithGrad<BatchArray>> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut WithGrad<BatchArray>> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}
