//! Error types shared across the crate.
//!
//! Shape and pairing errors are precondition violations surfaced at the call
//! that caused them. Backend errors are fatal for the current call; nothing is
//! retried and no operation falls back to the CPU on its own.

use thiserror::Error;

use crate::Real;
use crate::backend::Backend;
use crate::functions::FunctionId;

/// Errors raised by containers, functions and stacks.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NnError {
    /// A flat buffer does not hold the number of elements its layout requires.
    #[error("shape mismatch: expected {expected} elements, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    /// Two containers that must share a layout do not.
    #[error("dimension mismatch: expected {expected:?}, got {got:?}")]
    DimensionMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// A context produced by one function was handed to another.
    #[error("context belongs to function {got} but was passed to function {expected}")]
    ContextMismatch { expected: FunctionId, got: FunctionId },

    /// A tape does not hold one context per function of the stack.
    #[error("tape holds {got} contexts but the stack has {expected} functions")]
    TapeMismatch { expected: usize, got: usize },

    /// An id or index is outside the range a function accepts.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    /// A value read as an id or index is NaN or infinite.
    #[error("index {0} is not a finite number")]
    NonFiniteIndex(Real),

    /// The parallel backend failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Failures of the parallel compute backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// The requested backend was not compiled in.
    #[error("backend {0:?} is not available in this build")]
    Unavailable(Backend),

    /// No suitable adapter could be requested.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// The device could not be created.
    #[error("device error: {0}")]
    Device(String),

    /// A kernel failed validation or compilation.
    #[error("failed to build kernel `{kernel}`: {message}")]
    KernelBuild { kernel: String, message: String },

    /// A device buffer could not be allocated, or exceeds the device limits.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Recording or submitting device work failed validation.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// A staging buffer could not be mapped for reading.
    #[error("buffer map error: {0}")]
    Map(String),

    /// Waiting on the device failed.
    #[error("device poll error: {0}")]
    Poll(String),

    /// Downloaded bytes could not be viewed as floats.
    #[error("buffer cast error: {0}")]
    Cast(String),
}

/// Crate-wide result alias.
pub type Result<T, E = NnError> = core::result::Result<T, E>;
