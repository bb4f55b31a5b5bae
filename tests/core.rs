use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use briny_chain::Real;
use briny_chain::backend::{Backend, get_backend, set_backend};
use briny_chain::error::{BackendError, NnError};
use briny_chain::functions::{
    ActivationFn, Elu, Function, Linear, ReLU, Sigmoid, Softmax, Softplus, Tanh,
};
use briny_chain::loss::{LossFunction, SoftmaxCrossEntropy};
use briny_chain::ops::Executor;
use briny_chain::ops::cpu::CpuExecutor;
use briny_chain::optim::{Adam, MomentumSgd, Optimizer};
use briny_chain::stack::FunctionStack;
use briny_chain::tensors::BatchArray;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const W1: [Real; 6] = [0.1, 0.2, 0.3, -0.1, -0.2, 0.4];
const W2: [Real; 3] = [1.0, -1.0, 0.5];
const B2: Real = 0.25;

fn small_mlp() -> FunctionStack {
    FunctionStack::new(vec![
        Box::new(Linear::with_weights("l1", 2, 3, W1.to_vec(), Some(vec![0.0; 3])).unwrap()),
        Box::new(Tanh::new("l1 tanh")),
        Box::new(Linear::with_weights("l2", 3, 1, W2.to_vec(), Some(vec![B2])).unwrap()),
    ])
}

fn random_batch(rng: &mut StdRng, shape: Vec<usize>, batch: usize) -> BatchArray {
    let len = shape.iter().product::<usize>() * batch;
    let data = (0..len).map(|_| rng.random_range(-2.0..2.0)).collect();
    BatchArray::new(data, shape, batch).unwrap()
}

fn activations() -> Vec<Box<dyn Function>> {
    vec![
        Box::new(Tanh::new("tanh")),
        Box::new(Sigmoid::new("sigmoid")),
        Box::new(ReLU::new("relu")),
        Box::new(Softplus::new("softplus")),
        Box::new(Elu::new("elu")),
    ]
}

#[test]
fn test_end_to_end_chain_rule() {
    let mut model = small_mlp();
    let x = BatchArray::from_vec(vec![1.0, 2.0]);

    let (y, tape) = model.forward(&x).unwrap();
    let gx = model
        .backward(&BatchArray::from_vec(vec![1.0]), tape)
        .unwrap();

    // by hand
    let xs = [1.0 as Real, 2.0];
    let h: Vec<Real> = (0..3)
        .map(|o| W1[o * 2] * xs[0] + W1[o * 2 + 1] * xs[1])
        .collect();
    let a: Vec<Real> = h.iter().map(|v| v.tanh()).collect();
    let expected_y: Real = a.iter().zip(W2).map(|(a, w)| a * w).sum::<Real>() + B2;
    let gh: Vec<Real> = a.iter().zip(W2).map(|(a, w)| w * (1.0 - a * a)).collect();
    let expected_gx = [
        (0..3).map(|o| gh[o] * W1[o * 2]).sum::<Real>(),
        (0..3).map(|o| gh[o] * W1[o * 2 + 1]).sum::<Real>(),
    ];

    assert_eq!(y.shape(), &[1]);
    assert!((y.data()[0] - expected_y).abs() < 1e-5);
    assert!((y.data()[0] - 0.880_974).abs() < 1e-4);
    for (g, e) in gx.data().iter().zip(expected_gx) {
        assert!((g - e).abs() < 1e-5, "{g} vs {e}");
    }

    // gW2 = a, gb2 = 1, gW1 = gh ⊗ x, gb1 = gh
    let l2 = model.get(2).unwrap().parameters();
    for (g, e) in l2[0].grad.data().iter().zip(&a) {
        assert!((g - e).abs() < 1e-5);
    }
    assert_eq!(l2[1].grad.data(), &[1.0]);

    let l1 = model.get(0).unwrap().parameters();
    for o in 0..3 {
        for i in 0..2 {
            let g = l1[0].grad.data()[o * 2 + i];
            assert!((g - gh[o] * xs[i]).abs() < 1e-5);
        }
        assert!((l1[1].grad.data()[o] - gh[o]).abs() < 1e-5);
    }
}

#[test]
fn test_stack_matches_manual_chaining() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut model = FunctionStack::new(vec![
        Box::new(Linear::with_rng("l1", 4, 5, false, &mut rng)),
        Box::new(Sigmoid::new("sig")),
        Box::new(Linear::with_rng("l2", 5, 3, false, &mut rng)),
        Box::new(Softmax::new("softmax")),
    ]);
    let x = random_batch(&mut rng, vec![4], 3);
    let gy = random_batch(&mut rng, vec![3], 3);

    let (y, tape) = model.forward(&x).unwrap();
    let gx = model.backward(&gy, tape).unwrap();
    let stacked_grads: Vec<BatchArray> = model
        .iter()
        .flat_map(|f| f.parameters().into_iter().map(|p| p.grad.clone()))
        .collect();
    model.zero_grads();

    let mut manual_y = x.clone();
    let mut contexts = Vec::new();
    for f in model.iter() {
        let (next, ctx) = f.forward(&manual_y).unwrap();
        contexts.push(ctx);
        manual_y = next;
    }
    assert_eq!(manual_y, y);

    let mut manual_g = gy.clone();
    for i in (0..model.len()).rev() {
        let ctx = contexts.pop().unwrap();
        manual_g = model.get_mut(i).unwrap().backward(&manual_g, ctx).unwrap();
    }
    assert_eq!(manual_g, gx);

    let manual_grads: Vec<BatchArray> = model
        .iter()
        .flat_map(|f| f.parameters().into_iter().map(|p| p.grad.clone()))
        .collect();
    assert_eq!(manual_grads, stacked_grads);
}

#[test]
fn test_backward_preserves_layout() {
    let mut rng = StdRng::seed_from_u64(3);
    let x = random_batch(&mut rng, vec![2, 3], 4);

    for mut f in activations() {
        let (y, ctx) = f.forward(&x).unwrap();
        assert!(y.same_layout(&x), "{}", f.name());

        let gx = f.backward(&BatchArray::zeros(vec![2, 3], 4).unwrap(), ctx).unwrap();
        assert!(gx.same_layout(&x), "{}", f.name());
    }
}

#[test]
fn test_forward_is_idempotent() {
    let model = small_mlp();
    let a = BatchArray::new(vec![0.3, -0.7, 1.5, 0.2], vec![2], 2).unwrap();
    let b = BatchArray::new(a.data().to_vec(), vec![2], 2).unwrap();

    let (ya, _) = model.forward(&a).unwrap();
    let (yb, _) = model.forward(&b).unwrap();
    let yc = model.predict(&a).unwrap();
    assert_eq!(ya, yb);
    assert_eq!(ya, yc);
    // inputs are untouched
    assert_eq!(a, b);
}

#[test]
fn test_outstanding_contexts_pair_with_their_forward() {
    let mut tanh = Tanh::new("tanh");
    let x1 = BatchArray::from_vec(vec![0.5]);
    let x2 = BatchArray::from_vec(vec![-1.5]);

    let (y1, c1) = tanh.forward(&x1).unwrap();
    let (y2, c2) = tanh.forward(&x2).unwrap();

    let one = BatchArray::from_vec(vec![1.0]);
    let g2 = tanh.backward(&one, c2).unwrap();
    let g1 = tanh.backward(&one, c1).unwrap();
    assert!((g1.data()[0] - (1.0 - y1.data()[0].powi(2))).abs() < 1e-6);
    assert!((g2.data()[0] - (1.0 - y2.data()[0].powi(2))).abs() < 1e-6);
}

#[test]
fn test_context_from_other_function_is_rejected() {
    let a = Tanh::new("a");
    let mut b = Tanh::new("b");
    let (_, ctx) = a.forward(&BatchArray::from_vec(vec![1.0])).unwrap();

    let err = b.backward(&BatchArray::from_vec(vec![1.0]), ctx).unwrap_err();
    assert_eq!(
        err,
        NnError::ContextMismatch {
            expected: b.id(),
            got: a.id()
        }
    );
}

#[derive(Debug, Default)]
struct CountingExecutor {
    forward: AtomicUsize,
    backward: AtomicUsize,
}

impl Executor for CountingExecutor {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn forward(&self, f: &dyn ActivationFn, y: &mut [Real]) -> Result<(), BackendError> {
        self.forward.fetch_add(1, Ordering::Relaxed);
        CpuExecutor.forward(f, y)
    }

    fn backward(
        &self,
        f: &dyn ActivationFn,
        prev_output: &[Real],
        gx: &mut [Real],
    ) -> Result<(), BackendError> {
        self.backward.fetch_add(1, Ordering::Relaxed);
        CpuExecutor.backward(f, prev_output, gx)
    }
}

#[derive(Debug)]
struct BrokenExecutor;

impl Executor for BrokenExecutor {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn forward(&self, _: &dyn ActivationFn, _: &mut [Real]) -> Result<(), BackendError> {
        Err(BackendError::Device("lost".into()))
    }

    fn backward(
        &self,
        _: &dyn ActivationFn,
        _: &[Real],
        _: &mut [Real],
    ) -> Result<(), BackendError> {
        Err(BackendError::Device("lost".into()))
    }
}

#[test]
fn test_injected_executor_runs_activation() {
    let exec = Arc::new(CountingExecutor::default());
    let mut relu = ReLU::with_executor("relu", exec.clone());
    let plain = ReLU::new("plain");
    let x = BatchArray::from_vec(vec![-1.0, 2.0]);

    let (y, ctx) = relu.forward(&x).unwrap();
    assert_eq!(y, plain.forward(&x).unwrap().0);
    relu.backward(&BatchArray::from_vec(vec![1.0, 1.0]), ctx).unwrap();

    assert_eq!(exec.forward.load(Ordering::Relaxed), 1);
    assert_eq!(exec.backward.load(Ordering::Relaxed), 1);
}

#[test]
fn test_backend_failure_is_not_retried_on_cpu() {
    let sigmoid = Sigmoid::with_executor("sigmoid", Arc::new(BrokenExecutor));
    assert_eq!(sigmoid.backend(), Backend::Wgpu);

    let err = sigmoid.forward(&BatchArray::from_vec(vec![0.0])).unwrap_err();
    assert_eq!(err, NnError::Backend(BackendError::Device("lost".into())));
}

// the only test in this binary that touches the process default
#[test]
fn test_backend_constructors_follow_the_default() {
    set_backend(Backend::Cpu);
    let tanh = Tanh::with_default_backend("tanh").unwrap();
    assert_eq!(tanh.backend(), Backend::Cpu);
    let relu = ReLU::with_backend("relu", Backend::Cpu).unwrap();
    assert_eq!(relu.backend(), Backend::Cpu);

    #[cfg(not(feature = "wgpu"))]
    {
        set_backend(Backend::Wgpu);
        assert_eq!(get_backend(), Backend::Wgpu);
        let err = Tanh::with_default_backend("tanh").unwrap_err();
        set_backend(Backend::Cpu);
        assert_eq!(err, BackendError::Unavailable(Backend::Wgpu));

        let err = Sigmoid::with_backend("sigmoid", Backend::Wgpu).unwrap_err();
        assert_eq!(err, BackendError::Unavailable(Backend::Wgpu));
    }
    assert_eq!(get_backend(), Backend::Cpu);
}

#[test]
fn test_training_reduces_loss() {
    let mut rng = StdRng::seed_from_u64(11);
    for prototype in [
        &Adam::new(0.05, 0.9, 0.999, 1e-8) as &dyn Optimizer,
        &MomentumSgd::new(0.1, 0.9),
    ] {
        let mut model = FunctionStack::new(vec![
            Box::new(Linear::with_rng("l1", 2, 8, false, &mut rng)),
            Box::new(Tanh::new("tanh")),
            Box::new(Linear::with_rng("l2", 8, 2, false, &mut rng)),
        ]);
        model.set_optimizer(prototype);

        // class 1 iff the first input is positive
        let x = BatchArray::new(
            vec![1.0, 1.0, -1.0, -1.0, 1.0, -1.0, -1.0, 1.0],
            vec![2],
            4,
        )
        .unwrap();
        let t = BatchArray::new(vec![1.0, 0.0, 1.0, 0.0], Vec::new(), 4).unwrap();

        let mut losses = Vec::new();
        for _ in 0..200 {
            let (y, tape) = model.forward(&x).unwrap();
            let (loss, gy) = SoftmaxCrossEntropy.evaluate(&y, &t).unwrap();
            model.backward(&gy, tape).unwrap();
            model.update();
            losses.push(loss);
        }

        let first = losses[0];
        let last = losses[losses.len() - 1];
        assert!(last < first * 0.5, "{}: {first} -> {last}", prototype.name());
    }
}
