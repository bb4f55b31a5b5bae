//! Ordered composition of functions.
//!
//! A [`FunctionStack`] runs its functions front to back on forward and back
//! to front on backward. The order is fixed at construction; only the
//! parameters inside the functions change.
//!
//! Forward returns a [`Tape`] holding one [`Context`] per function. Backward
//! consumes it, so a tape can be replayed at most once and only on the stack
//! that recorded it.
//!
//! # Training step
//!
//! `forward → loss → backward → update`. Calling [`FunctionStack::update`]
//! without a preceding backward applies whatever gradients are currently
//! accumulated (zero after the previous update).
//!
//! # Optimizers
//!
//! [`FunctionStack::set_optimizer`] binds one optimizer instance to every
//! function that owns parameters. Each binding is a fresh copy of the given
//! optimizer, so moment estimates and step counters are kept per function.

use log::{debug, trace};

use crate::error::{NnError, Result};
use crate::functions::{Context, Function};
use crate::optim::Optimizer;
use crate::tensors::BatchArray;

/// Contexts recorded by one [`FunctionStack::forward`] call, in stack order.
///
/// Tapes cannot be copied, so each one drives at most one backward pass:
///
/// ```rust,compile_fail
/// use briny_chain::functions::Tanh;
/// use briny_chain::stack::FunctionStack;
/// use briny_chain::tensors::BatchArray;
///
/// let mut model = FunctionStack::new(vec![Box::new(Tanh::new("tanh"))]);
/// let x = BatchArray::from_vec(vec![1.0]);
/// let (y, tape) = model.forward(&x).unwrap();
/// let again = tape.clone();
/// model.backward(&y, tape).unwrap();
/// model.backward(&y, again).unwrap();
/// ```
#[must_use = "a tape is needed to run the matching backward pass"]
#[derive(Debug, PartialEq)]
pub struct Tape {
    contexts: Vec<Context>,
}

impl Tape {
    /// Number of recorded contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// The recorded contexts, in stack order.
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }
}

#[derive(Debug)]
struct Slot {
    function: Box<dyn Function>,
    optimizer: Option<Box<dyn Optimizer>>,
}

/// An ordered, structurally fixed list of functions.
#[derive(Debug, Default)]
pub struct FunctionStack {
    slots: Vec<Slot>,
}

impl FunctionStack {
    /// Builds a stack running `functions` in the given order.
    pub fn new(functions: Vec<Box<dyn Function>>) -> Self {
        let slots = functions
            .into_iter()
            .map(|function| Slot {
                function,
                optimizer: None,
            })
            .collect();
        Self { slots }
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the stack has no functions.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The function at position `i`.
    pub fn get(&self, i: usize) -> Option<&dyn Function> {
        self.slots.get(i).map(|s| s.function.as_ref())
    }

    /// The function at position `i`, mutably.
    pub fn get_mut(&mut self, i: usize) -> Option<&mut (dyn Function + 'static)> {
        self.slots.get_mut(i).map(|s| s.function.as_mut())
    }

    /// Iterates the functions in stack order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Function> + '_ {
        self.slots.iter().map(|s| s.function.as_ref())
    }

    /// Runs every function in order.
    ///
    /// # Errors
    /// Returns the first error raised by a function.
    pub fn forward(&self, x: &BatchArray) -> Result<(BatchArray, Tape)> {
        let mut contexts = Vec::with_capacity(self.slots.len());
        let mut y = x.clone();

        for slot in &self.slots {
            trace!(
                "forward `{}`: shape {:?} x {}",
                slot.function.name(),
                y.shape(),
                y.batch_count()
            );
            let (next, ctx) = slot.function.forward(&y)?;
            contexts.push(ctx);
            y = next;
        }

        Ok((y, Tape { contexts }))
    }

    /// Runs every function in order, discarding the contexts.
    ///
    /// # Errors
    /// Same as [`FunctionStack::forward`].
    pub fn predict(&self, x: &BatchArray) -> Result<BatchArray> {
        self.forward(x).map(|(y, _)| y)
    }

    /// Runs every function's backward in reverse order, consuming `tape`.
    ///
    /// Parameter gradients accumulate in the functions.
    ///
    /// # Errors
    /// - [`NnError::TapeMismatch`] if `tape` was recorded on a stack of another length
    /// - [`NnError::ContextMismatch`] if it was recorded on another stack
    /// - any error raised by a function
    pub fn backward(&mut self, gy: &BatchArray, tape: Tape) -> Result<BatchArray> {
        if tape.len() != self.slots.len() {
            return Err(NnError::TapeMismatch {
                expected: self.slots.len(),
                got: tape.len(),
            });
        }
        // reject a foreign tape before any gradient is accumulated
        for (slot, ctx) in self.slots.iter().zip(tape.contexts()) {
            if ctx.owner() != slot.function.id() {
                return Err(NnError::ContextMismatch {
                    expected: slot.function.id(),
                    got: ctx.owner(),
                });
            }
        }

        let mut g = gy.clone();
        for (slot, ctx) in self.slots.iter_mut().zip(tape.contexts).rev() {
            trace!("backward `{}`", slot.function.name());
            g = slot.function.backward(&g, ctx)?;
        }

        Ok(g)
    }

    /// Binds a fresh copy of `optimizer` to every function that owns parameters.
    ///
    /// Replaces any earlier binding, discarding its state.
    pub fn set_optimizer(&mut self, optimizer: &dyn Optimizer) {
        for slot in &mut self.slots {
            if slot.function.has_parameters() {
                debug!("binding {} to `{}`", optimizer.name(), slot.function.name());
                slot.optimizer = Some(optimizer.fresh());
            }
        }
    }

    /// Applies each bound optimizer to its function's parameters, then clears
    /// the gradients of those functions.
    ///
    /// Must follow a backward pass to have an effect.
    pub fn update(&mut self) {
        for slot in &mut self.slots {
            let Some(optimizer) = slot.optimizer.as_mut() else {
                continue;
            };
            optimizer.update(&mut slot.function.parameters_mut());
            slot.function.zero_grads();
        }
    }

    /// Clears every accumulated gradient.
    pub fn zero_grads(&mut self) {
        for slot in &mut self.slots {
            slot.function.zero_grads();
        }
    }
}
