//! Optimizers.
//!
//! An [`Optimizer`] updates parameters in place from their accumulated
//! gradients. It does not clear the gradients; the
//! [`FunctionStack`](crate::stack::FunctionStack) does that after the update.
//!
//! Stateful optimizers keep their auxiliary buffers per parameter index, so
//! one instance must always see the parameters of the same function in the
//! same order. The stack guarantees this by giving every function its own
//! instance ([`Optimizer::fresh`]).

use core::fmt;

use crate::Real;
use crate::tensors::{BatchArray, WithGrad};

/// Update rule applied after a backward pass.
pub trait Optimizer: fmt::Debug + Send {
    /// Human readable name.
    fn name(&self) -> &str;

    /// Updates every parameter from its gradient.
    fn update(&mut self, params: &mut [&mut WithGrad<BatchArray>]);

    /// A new optimizer with the same hyper-parameters and empty state.
    fn fresh(&self) -> Box<dyn Optimizer>;
}

/// Plain stochastic gradient descent: `p -= lr * g`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    pub lr: Real,
}

impl Sgd {
    pub const fn new(lr: Real) -> Self {
        Self { lr }
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "SGD"
    }

    fn update(&mut self, params: &mut [&mut WithGrad<BatchArray>]) {
        for p in params.iter_mut() {
            let (value, grad) = p.split_mut();
            for (v, g) in value.data_mut().iter_mut().zip(grad.data()) {
                *v -= self.lr * g;
            }
        }
    }

    fn fresh(&self) -> Box<dyn Optimizer> {
        Box::new(*self)
    }
}

/// SGD with momentum: `v = momentum * v - lr * g; p += v`.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumSgd {
    pub lr: Real,
    pub momentum: Real,
    velocity: Vec<Vec<Real>>,
}

impl MomentumSgd {
    pub fn new(lr: Real, momentum: Real) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Default for MomentumSgd {
    fn default() -> Self {
        Self::new(0.01, 0.9)
    }
}

impl Optimizer for MomentumSgd {
    fn name(&self) -> &str {
        "MomentumSGD"
    }

    fn update(&mut self, params: &mut [&mut WithGrad<BatchArray>]) {
        resize_state(&mut self.velocity, params);

        for (p, vel) in params.iter_mut().zip(&mut self.velocity) {
            let (value, grad) = p.split_mut();
            for ((w, g), v) in value.data_mut().iter_mut().zip(grad.data()).zip(vel) {
                *v = self.momentum * *v - self.lr * g;
                *w += *v;
            }
        }
    }

    fn fresh(&self) -> Box<dyn Optimizer> {
        Box::new(Self::new(self.lr, self.momentum))
    }
}

/// Adam with bias-corrected step size.
///
/// Per call, with step `t`:
///
/// ```text
/// lr_t = alpha * sqrt(1 - beta2^t) / (1 - beta1^t)
/// m   += (1 - beta1) * (g - m)
/// v   += (1 - beta2) * (g² - v)
/// p   -= lr_t * m / (sqrt(v) + eps)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    pub alpha: Real,
    pub beta1: Real,
    pub beta2: Real,
    pub eps: Real,
    t: i32,
    m: Vec<Vec<Real>>,
    v: Vec<Vec<Real>>,
}

impl Adam {
    pub fn new(alpha: Real, beta1: Real, beta2: Real, eps: Real) -> Self {
        Self {
            alpha,
            beta1,
            beta2,
            eps,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Number of updates applied so far.
    pub fn step(&self) -> i32 {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "Adam"
    }

    fn update(&mut self, params: &mut [&mut WithGrad<BatchArray>]) {
        resize_state(&mut self.m, params);
        resize_state(&mut self.v, params);

        self.t += 1;
        let fix1 = 1.0 - self.beta1.powi(self.t);
        let fix2 = 1.0 - self.beta2.powi(self.t);
        let lr = self.alpha * fix2.sqrt() / fix1;

        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            let (value, grad) = p.split_mut();
            let it = value.data_mut().iter_mut().zip(grad.data()).zip(m).zip(v);
            for (((w, &g), m), v) in it {
                *m += (1.0 - self.beta1) * (g - *m);
                *v += (1.0 - self.beta2) * (g * g - *v);
                *w -= lr * *m / (v.sqrt() + self.eps);
            }
        }
    }

    fn fresh(&self) -> Box<dyn Optimizer> {
        Box::new(Self::new(self.alpha, self.beta1, self.beta2, self.eps))
    }
}

// one zeroed buffer per parameter, reset if a parameter changed size
fn resize_state(state: &mut Vec<Vec<Real>>, params: &[&mut WithGrad<BatchArray>]) {
    state.resize_with(params.len(), Vec::new);
    for (s, p) in state.iter_mut().zip(params) {
        if s.len() != p.value.len() {
            *s = vec![0.0; p.value.len()];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(value: Vec<Real>, grad: Vec<Real>) -> WithGrad<BatchArray> {
        WithGrad {
            value: BatchArray::from_vec(value),
            grad: BatchArray::from_vec(grad),
        }
    }

    #[test]
    fn sgd_steps_against_gradient() {
        let mut p = param(vec![1.0, -1.0], vec![0.5, -2.0]);
        Sgd::new(0.1).update(&mut [&mut p]);
        assert!((p.value.data()[0] - 0.95).abs() < 1e-6);
        assert!((p.value.data()[1] + 0.8).abs() < 1e-6);
        // gradients are left for the caller to clear
        assert_eq!(p.grad.data(), &[0.5, -2.0]);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut opt = MomentumSgd::new(0.1, 0.5);
        let mut p = param(vec![0.0], vec![1.0]);

        opt.update(&mut [&mut p]);
        assert!((p.value.data()[0] + 0.1).abs() < 1e-6);
        // v = 0.5 * -0.1 - 0.1
        opt.update(&mut [&mut p]);
        assert!((p.value.data()[0] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn first_adam_step_moves_by_alpha() {
        let mut opt = Adam::default();
        let mut p = param(vec![1.0, 1.0], vec![3.0, -0.5]);
        opt.update(&mut [&mut p]);

        // after one step m/sqrt(v) is sign(g) once bias corrected
        assert!((p.value.data()[0] - (1.0 - 0.001)).abs() < 1e-5);
        assert!((p.value.data()[1] - (1.0 + 0.001)).abs() < 1e-5);
        assert_eq!(opt.step(), 1);
    }

    #[test]
    fn fresh_copies_hyper_parameters_only() {
        let mut opt = Adam::new(0.01, 0.8, 0.99, 1e-7);
        let mut p = param(vec![0.0], vec![1.0]);
        opt.update(&mut [&mut p]);

        let fresh = opt.fresh();
        assert_eq!(fresh.name(), "Adam");
        assert_eq!(format!("{fresh:?}"), format!("{:?}", Adam::new(0.01, 0.8, 0.99, 1e-7)));
    }
}
