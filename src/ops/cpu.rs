//! CPU backend operations.
//!
//! # CPU Backend
//!
//! [`CpuExecutor`] runs activations as plain sequential loops on the calling
//! thread, applying the scalar transform to every element in place. It is the
//! reference the GPU path is checked against.
//!
//! The dense helpers below back [`Linear`](crate::functions::Linear) and
//! [`Softmax`](crate::functions::Softmax). They split work per batch row or
//! per weight row with [`rayon`](https://docs.rs/rayon); each row is computed
//! by a single thread in a fixed order, so results are deterministic.

use rayon::prelude::*;

use super::Executor;
use crate::Real;
use crate::backend::Backend;
use crate::error::BackendError;
use crate::functions::ActivationFn;

/// Sequential elementwise executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuExecutor;

impl Executor for CpuExecutor {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn forward(&self, f: &dyn ActivationFn, y: &mut [Real]) -> Result<(), BackendError> {
        for v in y.iter_mut() {
            *v = f.forward_activate(*v);
        }
        Ok(())
    }

    fn backward(
        &self,
        f: &dyn ActivationFn,
        prev_output: &[Real],
        gx: &mut [Real],
    ) -> Result<(), BackendError> {
        for (g, &y) in gx.iter_mut().zip(prev_output) {
            *g = f.backward_activate(*g, y);
        }
        Ok(())
    }
}

/// Computes `y = x Wᵀ + b` for every batch row.
///
/// - `x`: `batch × input` row-major
/// - `w`: `output × input` row-major
/// - `b`: optional `output` bias
pub fn linear_forward(
    x: &[Real],
    w: &[Real],
    b: Option<&[Real]>,
    input: usize,
    output: usize,
) -> Vec<Real> {
    let batch = if input == 0 { 0 } else { x.len() / input };
    let mut y = vec![0.0; batch * output];
    if output == 0 {
        return y;
    }

    y.par_chunks_mut(output).enumerate().for_each(|(n, row)| {
        let xs = &x[n * input..(n + 1) * input];
        for (o, out) in row.iter_mut().enumerate() {
            let ws = &w[o * input..(o + 1) * input];
            let mut sum = b.map_or(0.0, |b| b[o]);
            for (xi, wi) in xs.iter().zip(ws) {
                sum += xi * wi;
            }
            *out = sum;
        }
    });

    y
}

/// Accumulates the weight gradient `gw += gyᵀ x` over all batch rows.
pub fn linear_weight_grad(gy: &[Real], x: &[Real], gw: &mut [Real], input: usize, output: usize) {
    if input == 0 {
        return;
    }
    let batch = x.len() / input;

    gw.par_chunks_mut(input).enumerate().for_each(|(o, row)| {
        for n in 0..batch {
            let g = gy[n * output + o];
            if g == 0.0 {
                continue;
            }
            let xs = &x[n * input..(n + 1) * input];
            for (acc, xi) in row.iter_mut().zip(xs) {
                *acc += g * xi;
            }
        }
    });
}

/// Accumulates the bias gradient `gb += Σ_batch gy`.
pub fn linear_bias_grad(gy: &[Real], gb: &mut [Real], output: usize) {
    if output == 0 {
        return;
    }
    for row in gy.chunks(output) {
        for (acc, g) in gb.iter_mut().zip(row) {
            *acc += g;
        }
    }
}

/// Computes the input gradient `gx = gy W` for every batch row.
pub fn linear_input_grad(gy: &[Real], w: &[Real], input: usize, output: usize) -> Vec<Real> {
    let batch = if output == 0 { 0 } else { gy.len() / output };
    let mut gx = vec![0.0; batch * input];
    if input == 0 {
        return gx;
    }

    gx.par_chunks_mut(input).enumerate().for_each(|(n, row)| {
        let gs = &gy[n * output..(n + 1) * output];
        for (o, &g) in gs.iter().enumerate() {
            let ws = &w[o * input..(o + 1) * input];
            for (acc, wi) in row.iter_mut().zip(ws) {
                *acc += g * wi;
            }
        }
    });

    gx
}

/// Softmax over each row of length `width`, stabilised by the row maximum.
pub fn softmax_rows(x: &[Real], width: usize) -> Vec<Real> {
    let mut y = x.to_vec();
    if width == 0 {
        return y;
    }

    y.par_chunks_mut(width).for_each(|row| {
        let max = row.iter().copied().fold(Real::NEG_INFINITY, Real::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    });

    y
}

/// Softmax backward over each row: `gx = y * (gy - Σ gy*y)`.
pub fn softmax_rows_backward(gy: &[Real], y: &[Real], width: usize) -> Vec<Real> {
    let mut gx = vec![0.0; gy.len()];
    if width == 0 {
        return gx;
    }

    gx.par_chunks_mut(width)
        .zip(gy.par_chunks(width).zip(y.par_chunks(width)))
        .for_each(|(out, (gs, ys))| {
            let dot: Real = gs.iter().zip(ys).map(|(g, y)| g * y).sum();
            for ((o, g), y) in out.iter_mut().zip(gs).zip(ys) {
                *o = y * (g - dot);
            }
        });

    gx
}
