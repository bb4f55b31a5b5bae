//! # Execution Layer
//!
//! Elementwise work is delegated to an [`Executor`], injected into each
//! activation at construction. The scalar transforms live in the activation
//! itself; executors only decide *where* they run.
//!
//! ## Submodules
//!
//! - [`cpu`]: sequential per-element loops, plus rayon-parallel helpers for
//!   the dense layers
//! - [`kernels`]: the table of WGSL expressions per activation kind and the
//!   kernel text generated from it
//! - [`wgpu`] *(opt-in)*: the shared GPU context ([`Weaver`](wgpu::Weaver))
//!   and its executor
//!
//! ## Extending the Backend
//!
//! To add a new elementwise activation:
//!
//! 1. Add a variant to [`ActivationKind`](crate::functions::ActivationKind)
//! 2. Add its WGSL expressions to [`kernels::source`]
//! 3. Implement [`ActivationFn`](crate::functions::ActivationFn) with the same formula
//!
//! ## Notes
//!
//! - Both paths must agree within rounding for identical inputs
//! - A failing GPU call returns an error; it never falls back to the CPU
//! - Executors are shared between functions; the GPU one is not meant to be
//!   driven from several threads at once

pub mod cpu;
pub mod kernels;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use core::fmt;

use crate::Real;
use crate::backend::Backend;
use crate::error::BackendError;
use crate::functions::ActivationFn;

/// Strategy that applies an activation's scalar transforms to whole buffers.
pub trait Executor: fmt::Debug + Send + Sync {
    /// The backend this executor runs on.
    fn backend(&self) -> Backend;

    /// Replaces every `y[i]` with `f.forward_activate(y[i])`.
    ///
    /// # Errors
    ///
    /// Returns the backend failure of a parallel executor.
    fn forward(&self, f: &dyn ActivationFn, y: &mut [Real]) -> Result<(), BackendError>;

    /// Replaces every `gx[i]` with `f.backward_activate(gx[i], prev_output[i])`.
    ///
    /// Callers guarantee `prev_output.len() == gx.len()`.
    ///
    /// # Errors
    ///
    /// Returns the backend failure of a parallel executor.
    fn backward(
        &self,
        f: &dyn ActivationFn,
        prev_output: &[Real],
        gx: &mut [Real],
    ) -> Result<(), BackendError>;
}
