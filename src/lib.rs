//! briny_chain: a minimal function-stack neural network toolkit in Rust.
//!
//! Discrete computational layers (activations, linear transforms, embeddings)
//! are chained into a differentiable pipeline. Each layer runs either on the
//! CPU or, with the `wgpu` feature, on a GPU through WebGPU compute shaders,
//! and gradients flow backward through the same chain.
//!
//! # Features
//!
//! - [`BatchArray`](tensors::BatchArray): flat buffer plus shape and batch count.
//! - [`Function`](functions::Function): forward/backward contract with explicit
//!   [`Context`](functions::Context) values pairing each backward call with its forward call.
//! - Elementwise activations with a dual CPU/GPU execution path.
//! - [`FunctionStack`](stack::FunctionStack): ordered composition with optimizer binding.
//! - Optimizers (SGD, momentum SGD, Adam) and loss functions (MSE, softmax cross entropy).
//!
//! # Modules
//!
//! - [`tensors`]: numeric container and gradient wrapper.
//! - [`functions`]: activations, linear, embedding and softmax layers.
//! - [`stack`]: whole-pipeline forward, backward and update.
//! - [`optim`]: update rules.
//! - [`loss`]: loss functions.
//! - [`ops`]: execution strategies (CPU loop, WebGPU kernels).
//! - [`backend`]: process default backend selection.
//!
//! # Feature Flags
//!
//! - `wgpu`: enables the WebGPU backend.
//! - `f64`: uses `f64` as [`Real`] instead of `f32`.
//!
//! # Example
//!
//! ```rust
//! use briny_chain::functions::{Linear, Tanh};
//! use briny_chain::optim::Sgd;
//! use briny_chain::stack::FunctionStack;
//! use briny_chain::tensors::BatchArray;
//!
//! # fn main() -> Result<(), briny_chain::error::NnError> {
//! let mut model = FunctionStack::new(vec![
//!     Box::new(Linear::new("l1", 2, 3, false)),
//!     Box::new(Tanh::new("l1 tanh")),
//!     Box::new(Linear::new("l2", 3, 1, false)),
//! ]);
//! model.set_optimizer(&Sgd::new(0.1));
//!
//! let x = BatchArray::from_vec(vec![1.0, 2.0]);
//! let (y, tape) = model.forward(&x)?;
//! model.backward(&BatchArray::from_vec(vec![1.0; y.len()]), tape)?;
//! model.update();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::unnecessary_cast, clippy::cast_precision_loss)]

pub mod approx;
pub mod backend;
pub mod error;
pub mod functions;
pub mod loss;
pub mod ops;
pub mod optim;
pub mod stack;
pub mod tensors;

#[cfg(not(feature = "f64"))]
type RealInner = f32;
#[cfg(feature = "f64")]
type RealInner = f64;

/// The real number type flowing through every container (`f32`, or `f64`
/// with the `f64` feature). Device buffers are always `f32`.
pub type Real = RealInner;
