//! CPU and GPU activations must agree within rounding.
//!
//! Run with `cargo test --features wgpu`. Skips when no adapter is present.
#![cfg(feature = "wgpu")]

use std::sync::Arc;

use briny_chain::Real;
use briny_chain::approx::{AVG_ERROR, ApproxEquality, RelativeEq, approx_eq, first_difference};
use briny_chain::backend::Backend;
use briny_chain::error::{BackendError, NnError};
use briny_chain::functions::{
    Activation, ActivationFn, EluFn, Function, ReLUFn, SigmoidFn, SoftplusFn, TanhFn,
};
use briny_chain::ops::wgpu::{Weaver, WgpuExecutor};
use briny_chain::tensors::BatchArray;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn weaver() -> Option<&'static Weaver> {
    match Weaver::global() {
        Ok(w) => Some(w),
        Err(e) => {
            eprintln!("skipping GPU parity: {e}");
            None
        }
    }
}

fn check<F: ActivationFn + Default>(weaver: &'static Weaver, x: &BatchArray, gy: &BatchArray) {
    let mut cpu = Activation::<F>::new("cpu");
    let mut gpu = Activation::<F>::with_executor("gpu", Arc::new(WgpuExecutor::new(weaver)));
    assert_eq!(gpu.backend(), Backend::Wgpu);

    let (y_cpu, ctx_cpu) = cpu.forward(x).unwrap();
    let (y_gpu, ctx_gpu) = gpu.forward(x).unwrap();
    let kind = cpu.kind();
    assert!(
        approx_eq(&y_gpu, &y_cpu),
        "{kind} forward: {:?}",
        first_difference(y_cpu.data(), y_gpu.data(), AVG_ERROR)
    );

    let g_cpu = cpu.backward(gy, ctx_cpu).unwrap();
    let g_gpu = gpu.backward(gy, ctx_gpu).unwrap();
    assert!(
        approx_eq(&g_gpu, &g_cpu),
        "{kind} backward: {:?}",
        first_difference(g_cpu.data(), g_gpu.data(), AVG_ERROR)
    );
}

fn random(rng: &mut StdRng, len: usize) -> Vec<Real> {
    (0..len).map(|_| rng.random_range(-3.0..3.0)).collect()
}

#[test]
fn test_activations_match_cpu() {
    let Some(weaver) = weaver() else {
        return;
    };
    let mut rng = StdRng::seed_from_u64(5);
    let x = BatchArray::new(random(&mut rng, 3 * 257), vec![257], 3).unwrap();
    let gy = BatchArray::new(random(&mut rng, 3 * 257), vec![257], 3).unwrap();

    check::<TanhFn>(weaver, &x, &gy);
    check::<SigmoidFn>(weaver, &x, &gy);
    check::<ReLUFn>(weaver, &x, &gy);
    check::<SoftplusFn>(weaver, &x, &gy);
    check::<EluFn>(weaver, &x, &gy);
}

#[test]
fn test_empty_input_skips_dispatch() {
    let Some(weaver) = weaver() else {
        return;
    };
    let tanh = Activation::<TanhFn>::with_executor("gpu", Arc::new(WgpuExecutor::new(weaver)));
    let (y, _) = tanh.forward(&BatchArray::zeros(vec![0], 2).unwrap()).unwrap();
    assert!(y.is_empty());
}

#[test]
fn test_softplus_large_inputs_match_cpu() {
    let Some(weaver) = weaver() else {
        return;
    };
    let x = BatchArray::from_vec(vec![-100.0, -20.0, 0.0, 20.0, 88.0, 100.0]);
    let cpu = Activation::<SoftplusFn>::new("cpu");
    let gpu = Activation::<SoftplusFn>::with_executor("gpu", Arc::new(WgpuExecutor::new(weaver)));

    let (y_cpu, _) = cpu.forward(&x).unwrap();
    let (y_gpu, _) = gpu.forward(&x).unwrap();
    assert!(y_gpu.data().iter().all(|v| v.is_finite()), "{:?}", y_gpu.data());
    // one ulp near 100 is already close to AVG_ERROR
    assert!(y_gpu.approx_eq(&y_cpu) <= ApproxEquality::Relative);
}

#[test]
fn test_oversized_buffer_is_a_backend_error() {
    let Some(weaver) = weaver() else {
        return;
    };
    let len = weaver.max_binding_len() + 1;
    let tanh = Activation::<TanhFn>::with_executor("gpu", Arc::new(WgpuExecutor::new(weaver)));

    let err = tanh.forward(&BatchArray::zeros(vec![len], 1).unwrap()).unwrap_err();
    assert!(
        matches!(err, NnError::Backend(BackendError::Allocation(_))),
        "{err}"
    );

    // the weaver stays usable afterwards
    let (y, _) = tanh.forward(&BatchArray::from_vec(vec![0.0])).unwrap();
    assert!(y.data()[0].abs() < 1e-6);
}

#[test]
fn test_validation_failures_are_captured() {
    let Some(weaver) = weaver() else {
        return;
    };
    let err = weaver
        .scoped(|| {
            weaver.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("bad_usage"),
                size: 16,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            })
        })
        .unwrap_err();
    assert!(matches!(err, BackendError::Dispatch(_)), "{err}");
}
