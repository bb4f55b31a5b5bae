//! Differentiable functions.
//!
//! A [`Function`] maps one [`BatchArray`] to another and knows how to send a
//! gradient back through itself. Forward returns a [`Context`] holding
//! whatever the matching backward call needs (the input for [`Linear`], the
//! output for activations). The context carries the id of the function that
//! made it, so handing it to any other function is rejected.
//!
//! Functions with trainable parameters keep them as
//! [`WithGrad<BatchArray>`]; backward accumulates into the gradients and an
//! [`Optimizer`](crate::optim::Optimizer) consumes them later.

mod activation;
mod embed_id;
mod linear;
mod softmax;

pub use self::activation::{
    Activation, ActivationFn, ActivationKind, Elu, EluFn, ReLU, ReLUFn, Sigmoid, SigmoidFn,
    Softplus, SoftplusFn, Tanh, TanhFn,
};
pub use self::embed_id::EmbedID;
pub use self::linear::Linear;
pub use self::softmax::Softmax;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::Real;
use crate::error::{NnError, Result};
use crate::tensors::{BatchArray, WithGrad};

/// Process-unique identity of a function instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(0);

impl FunctionId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        Self(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State saved by a forward call for the matching backward call.
///
/// Not `Clone`: backward consumes the context, so it pairs with exactly one
/// forward call.
#[must_use = "a context is needed to run the matching backward call"]
#[derive(Debug, PartialEq)]
pub struct Context {
    owner: FunctionId,
    saved: BatchArray,
}

impl Context {
    /// Records `saved` on behalf of the function `owner`.
    pub fn new(owner: FunctionId, saved: BatchArray) -> Self {
        Self { owner, saved }
    }

    /// The function that produced this context.
    pub fn owner(&self) -> FunctionId {
        self.owner
    }

    /// The saved array.
    pub fn saved(&self) -> &BatchArray {
        &self.saved
    }

    /// Takes the saved array out, checking that `id` produced it.
    ///
    /// # Errors
    /// Returns [`NnError::ContextMismatch`] if `id` is not the owner.
    pub fn claim(self, id: FunctionId) -> Result<BatchArray> {
        if self.owner != id {
            return Err(NnError::ContextMismatch {
                expected: id,
                got: self.owner,
            });
        }
        Ok(self.saved)
    }
}

/// A differentiable unit of computation.
///
/// `forward` never mutates the function; `backward` may, to accumulate
/// parameter gradients. Calling `backward` accumulates, it does not reset:
/// gradients are cleared by the stack after an update, or by
/// [`Function::zero_grads`].
pub trait Function: fmt::Debug + Send {
    /// Human readable name.
    fn name(&self) -> &str;

    /// Identity used to pair contexts with their producer.
    fn id(&self) -> FunctionId;

    /// Computes the output and the context for the matching backward call.
    ///
    /// # Errors
    /// Shape errors for incompatible inputs, or backend failures.
    fn forward(&self, x: &BatchArray) -> Result<(BatchArray, Context)>;

    /// Propagates `gy` back through this function using the context of the
    /// matching forward call, accumulating parameter gradients.
    ///
    /// # Errors
    /// [`NnError::ContextMismatch`] for a foreign context, shape errors if
    /// `gy` does not match the forward output, or backend failures.
    fn backward(&mut self, gy: &BatchArray, ctx: Context) -> Result<BatchArray>;

    /// Trainable parameters, in a fixed order.
    fn parameters(&self) -> Vec<&WithGrad<BatchArray>> {
        Vec::new()
    }

    /// Mutable trainable parameters, in the same order as [`Function::parameters`].
    fn parameters_mut(&mut self) -> Vec<&mut WithGrad<BatchArray>> {
        Vec::new()
    }

    /// Returns `true` if the function owns trainable parameters.
    fn has_parameters(&self) -> bool {
        !self.parameters().is_empty()
    }

    /// Clears every accumulated gradient.
    fn zero_grads(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}

/// Checks that the downstream gradient has the layout of the forward output.
pub(crate) fn check_gradient(gy: &BatchArray, expected: &[usize], batch_count: usize) -> Result<()> {
    if gy.shape() != expected || gy.batch_count() != batch_count {
        let mut want = expected.to_vec();
        want.push(batch_count);
        let mut got = gy.shape().to_vec();
        got.push(gy.batch_count());
        return Err(NnError::DimensionMismatch {
            expected: want,
            got,
        });
    }
    Ok(())
}

/// Reads `value` as an index into a range of `len` items, truncating toward zero.
pub(crate) fn index_of(value: Real, len: usize) -> Result<usize> {
    if !value.is_finite() {
        return Err(NnError::NonFiniteIndex(value));
    }
    let index = value as i64;
    if index < 0 || index as usize >= len {
        return Err(NnError::IndexOutOfRange { index, len });
    }
    Ok(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = FunctionId::next();
        let b = FunctionId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), format!("#{}", a.0));
    }

    #[test]
    fn foreign_context_is_rejected() {
        let owner = FunctionId::next();
        let other = FunctionId::next();
        let ctx = || Context::new(owner, BatchArray::from_vec(vec![1.0]));

        assert_eq!(
            ctx().claim(other),
            Err(NnError::ContextMismatch {
                expected: other,
                got: owner
            })
        );
        assert_eq!(ctx().claim(owner).map(BatchArray::into_data), Ok(vec![1.0]));
    }

    #[test]
    fn index_truncates_and_rejects_non_finite_values() {
        assert_eq!(index_of(2.9, 3), Ok(2));
        assert_eq!(index_of(-0.5, 3), Ok(0));
        assert_eq!(
            index_of(-1.0, 3),
            Err(NnError::IndexOutOfRange { index: -1, len: 3 })
        );
        assert!(matches!(index_of(Real::NAN, 3), Err(NnError::NonFiniteIndex(v)) if v.is_nan()));
        assert_eq!(
            index_of(Real::INFINITY, 3),
            Err(NnError::NonFiniteIndex(Real::INFINITY))
        );
    }
}
