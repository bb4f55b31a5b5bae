//! Loss functions.
//!
//! A loss compares the output of a stack with a target and returns the scalar
//! loss together with its gradient with respect to the output, ready to be
//! passed to [`FunctionStack::backward`](crate::stack::FunctionStack::backward).

use crate::Real;
use crate::error::{NnError, Result};
use crate::functions::index_of;
use crate::ops::cpu;
use crate::tensors::BatchArray;

/// Scalar objective with its gradient.
pub trait LossFunction {
    /// Returns the loss and `dL/d(input)`, laid out like `input`.
    ///
    /// # Errors
    /// Returns a shape error if `target` does not fit `input`.
    fn evaluate(&self, input: &BatchArray, target: &BatchArray) -> Result<(Real, BatchArray)>;
}

/// Mean squared error over every element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeanSquaredError;

impl LossFunction for MeanSquaredError {
    fn evaluate(&self, input: &BatchArray, target: &BatchArray) -> Result<(Real, BatchArray)> {
        if input.len() != target.len() {
            return Err(NnError::ShapeMismatch {
                expected: input.len(),
                got: target.len(),
            });
        }
        let n = input.len().max(1) as Real;

        let mut loss = 0.0;
        let grad = input
            .data()
            .iter()
            .zip(target.data())
            .map(|(y, t)| {
                let d = y - t;
                loss += d * d;
                2.0 * d / n
            })
            .collect();

        Ok((loss / n, BatchArray::convert(grad, input.shape(), input.batch_count())?))
    }
}

/// Softmax followed by cross entropy against class ids.
///
/// `target` holds one class id per batch entry of `input`; each entry of
/// `input` holds the unnormalized scores of every class. The loss is averaged
/// over the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftmaxCrossEntropy;

impl LossFunction for SoftmaxCrossEntropy {
    fn evaluate(&self, input: &BatchArray, target: &BatchArray) -> Result<(Real, BatchArray)> {
        let batch = input.batch_count();
        if target.len() != batch {
            return Err(NnError::ShapeMismatch {
                expected: batch,
                got: target.len(),
            });
        }
        let classes = input.volume();

        let mut grad = cpu::softmax_rows(input.data(), classes);
        let mut loss = 0.0;
        for (n, &t) in target.data().iter().enumerate() {
            let p = &mut grad[n * classes + index_of(t, classes)?];
            loss -= p.ln();
            *p -= 1.0;
        }

        let scale = 1.0 / batch.max(1) as Real;
        for g in &mut grad {
            *g *= scale;
        }

        Ok((
            loss * scale,
            BatchArray::convert(grad, input.shape(), batch)?,
        ))
    }
}
