//! Elementwise activation functions.
//!
//! Each activation is a pair of scalar transforms ([`ActivationFn`]) plus an
//! injected [`Executor`] that decides where the transforms run. The same
//! formulas exist as WGSL expressions in [`kernels`](crate::ops::kernels), so
//! the CPU loop and the GPU kernels agree up to rounding.

use core::fmt;
use std::sync::Arc;

use crate::Real;
use crate::backend::{Backend, get_backend};
use crate::error::{BackendError, NnError, Result};
use crate::functions::{Context, Function, FunctionId};
use crate::ops::Executor;
use crate::ops::cpu::CpuExecutor;
use crate::ops::kernels::{self, KernelSource};
use crate::tensors::BatchArray;

/// An enumeration of activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// Hyperbolic tangent.
    Tanh,
    /// Logistic sigmoid.
    Sigmoid,
    /// Rectified linear unit.
    ReLU,
    /// `ln(1 + eˣ)`.
    Softplus,
    /// Exponential linear unit with `alpha = 1`.
    Elu,
}

impl ActivationKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Tanh,
        Self::Sigmoid,
        Self::ReLU,
        Self::Softplus,
        Self::Elu,
    ];

    /// Lowercase name, used for kernel entry points.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::ReLU => "relu",
            Self::Softplus => "softplus",
            Self::Elu => "elu",
        }
    }

    /// The WGSL expressions of this kind.
    pub const fn kernel_source(self) -> KernelSource {
        kernels::source(self)
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The scalar transforms of an activation.
pub trait ActivationFn: fmt::Debug + Send + Sync {
    /// Enumerates type of activation function `Self` represents.
    fn kind(&self) -> ActivationKind;

    /// `y = f(x)`.
    fn forward_activate(&self, x: Real) -> Real;

    /// `gx = gy * f'(x)`, expressed through the forward output `y`.
    fn backward_activate(&self, gy: Real, y: Real) -> Real;

    /// WGSL expression of the forward transform, in `x`.
    fn forward_kernel_source(&self) -> &'static str {
        self.kind().kernel_source().forward
    }

    /// WGSL expression of the backward transform, in `gy` and `y`.
    fn backward_kernel_source(&self) -> &'static str {
        self.kind().kernel_source().backward
    }
}

/// Hyperbolic tangent transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TanhFn;

impl ActivationFn for TanhFn {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Tanh
    }

    fn forward_activate(&self, x: Real) -> Real {
        x.tanh()
    }

    fn backward_activate(&self, gy: Real, y: Real) -> Real {
        gy * (1.0 - y * y)
    }
}

/// Logistic sigmoid transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigmoidFn;

impl ActivationFn for SigmoidFn {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Sigmoid
    }

    fn forward_activate(&self, x: Real) -> Real {
        1.0 / (1.0 + (-x).exp())
    }

    fn backward_activate(&self, gy: Real, y: Real) -> Real {
        gy * y * (1.0 - y)
    }
}

/// ReLU transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReLUFn;

impl ActivationFn for ReLUFn {
    fn kind(&self) -> ActivationKind {
        ActivationKind::ReLU
    }

    fn forward_activate(&self, x: Real) -> Real {
        if x > 0.0 { x } else { 0.0 }
    }

    fn backward_activate(&self, gy: Real, y: Real) -> Real {
        if y > 0.0 { gy } else { 0.0 }
    }
}

/// Softplus transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftplusFn;

impl ActivationFn for SoftplusFn {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Softplus
    }

    // ln(1 + e^x) without overflowing e^x
    fn forward_activate(&self, x: Real) -> Real {
        x.max(0.0) + (-x.abs()).exp().ln_1p()
    }

    // f'(x) = sigmoid(x) = 1 - e^-y
    fn backward_activate(&self, gy: Real, y: Real) -> Real {
        gy * (1.0 - (-y).exp())
    }
}

/// ELU transforms (`alpha = 1`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EluFn;

impl ActivationFn for EluFn {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Elu
    }

    fn forward_activate(&self, x: Real) -> Real {
        if x > 0.0 { x } else { x.exp() - 1.0 }
    }

    fn backward_activate(&self, gy: Real, y: Real) -> Real {
        if y > 0.0 { gy } else { gy * (y + 1.0) }
    }
}

/// An elementwise [`Function`] applying `F` through an injected executor.
#[derive(Debug)]
pub struct Activation<F: ActivationFn> {
    name: String,
    id: FunctionId,
    f: F,
    executor: Arc<dyn Executor>,
}

/// Hyperbolic tangent activation.
pub type Tanh = Activation<TanhFn>;
/// Sigmoid activation.
pub type Sigmoid = Activation<SigmoidFn>;
/// ReLU activation.
pub type ReLU = Activation<ReLUFn>;
/// Softplus activation.
pub type Softplus = Activation<SoftplusFn>;
/// ELU activation.
pub type Elu = Activation<EluFn>;

impl<F: ActivationFn + Default> Activation<F> {
    /// An activation running on the CPU.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_executor(name, Arc::new(CpuExecutor))
    }

    /// An activation running on `backend`.
    ///
    /// # Errors
    /// Returns the backend's error if it is not compiled in or cannot start.
    pub fn with_backend(
        name: impl Into<String>,
        backend: Backend,
    ) -> core::result::Result<Self, BackendError> {
        Ok(Self::with_executor(name, backend.executor()?))
    }

    /// An activation running on the process default backend
    /// ([`get_backend`]).
    ///
    /// # Errors
    /// Same as [`Activation::with_backend`].
    pub fn with_default_backend(
        name: impl Into<String>,
    ) -> core::result::Result<Self, BackendError> {
        Self::with_backend(name, get_backend())
    }

    /// An activation delegating elementwise work to `executor`.
    pub fn with_executor(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            id: FunctionId::next(),
            f: F::default(),
            executor,
        }
    }
}

impl<F: ActivationFn> Activation<F> {
    /// The activation kind.
    pub fn kind(&self) -> ActivationKind {
        self.f.kind()
    }

    /// The scalar transforms.
    pub fn activation(&self) -> &F {
        &self.f
    }

    /// The backend elementwise work runs on.
    pub fn backend(&self) -> Backend {
        self.executor.backend()
    }

    /// WGSL expression of the forward kernel.
    pub fn forward_kernel_source(&self) -> &'static str {
        self.f.forward_kernel_source()
    }

    /// WGSL expression of the backward kernel.
    pub fn backward_kernel_source(&self) -> &'static str {
        self.f.backward_kernel_source()
    }
}

impl<F: ActivationFn> Function for Activation<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn forward(&self, x: &BatchArray) -> Result<(BatchArray, Context)> {
        let mut y = x.data().to_vec();
        self.executor.forward(&self.f, &mut y)?;

        let y = BatchArray::convert(y, x.shape(), x.batch_count())?;
        let ctx = Context::new(self.id, y.clone());
        Ok((y, ctx))
    }

    fn backward(&mut self, gy: &BatchArray, ctx: Context) -> Result<BatchArray> {
        let prev_output = ctx.claim(self.id)?;
        if gy.len() != prev_output.len() {
            return Err(NnError::ShapeMismatch {
                expected: prev_output.len(),
                got: gy.len(),
            });
        }

        let mut gx = gy.data().to_vec();
        self.executor.backward(&self.f, prev_output.data(), &mut gx)?;

        BatchArray::convert(gx, gy.shape(), gy.batch_count())
    }
}
