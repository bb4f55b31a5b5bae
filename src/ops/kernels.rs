//! Kernel table for elementwise activations.
//!
//! Each [`ActivationKind`] maps to a pair of WGSL expressions: the forward
//! expression reads `x`, the backward expression reads `gy` (the downstream
//! gradient) and `y` (the remembered forward output). The GPU backend wraps
//! them into two compute kernels per kind when it starts; nothing is formatted
//! per call.
//!
//! Kernel contract:
//!
//! - forward: one read-write buffer, `buf[i] = forward_activate(buf[i])`
//! - backward: one read-only buffer of previous outputs and one read-write
//!   gradient buffer, `gx[i] = backward_activate(gx[i], y[i])`
//!
//! Device buffers hold `f32`.

use crate::functions::ActivationKind;

/// Threads per workgroup along `x`.
pub const WORKGROUP_SIZE: u32 = 64;

/// Maximum workgroups dispatched along one dimension.
pub const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Global indices covered by one row of the dispatch grid.
pub const ROW_STRIDE: u32 = WORKGROUP_SIZE * MAX_GROUPS_PER_DIM;

/// The WGSL expressions of one activation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSource {
    /// Expression in `x` computing the activation.
    pub forward: &'static str,
    /// Expression in `gy` and `y` computing the upstream gradient.
    pub backward: &'static str,
}

/// Looks up the kernel expressions of `kind`.
pub const fn source(kind: ActivationKind) -> KernelSource {
    match kind {
        ActivationKind::Tanh => KernelSource {
            forward: "tanh(x)",
            backward: "gy * (1.0 - y * y)",
        },
        ActivationKind::Sigmoid => KernelSource {
            forward: "1.0 / (1.0 + exp(-x))",
            backward: "gy * y * (1.0 - y)",
        },
        ActivationKind::ReLU => KernelSource {
            forward: "select(0.0, x, x > 0.0)",
            backward: "select(0.0, gy, y > 0.0)",
        },
        ActivationKind::Softplus => KernelSource {
            forward: "max(x, 0.0) + log(1.0 + exp(-abs(x)))",
            backward: "gy * (1.0 - exp(-y))",
        },
        ActivationKind::Elu => KernelSource {
            forward: "select(exp(x) - 1.0, x, x > 0.0)",
            backward: "select(gy * (y + 1.0), gy, y > 0.0)",
        },
    }
}

/// Entry point name of the forward kernel of `kind`, e.g. `tanh_forward`.
pub fn forward_entry(kind: ActivationKind) -> String {
    format!("{}_forward", kind.name())
}

/// Entry point name of the backward kernel of `kind`, e.g. `tanh_backward`.
pub fn backward_entry(kind: ActivationKind) -> String {
    format!("{}_backward", kind.name())
}

/// Generates the WGSL module of the forward kernel of `kind`.
pub fn forward_module(kind: ActivationKind) -> String {
    let expr = source(kind).forward;
    let entry = forward_entry(kind);
    let workgroup = WORKGROUP_SIZE;
    let stride = ROW_STRIDE;

    format!(
        r"@group(0) @binding(0) var<storage, read_write> gpu_y: array<f32>;

fn forward_activate(x: f32) -> f32 {{
    return {expr};
}}

@compute @workgroup_size({workgroup})
fn {entry}(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.y * {stride}u + gid.x;
    if (i >= arrayLength(&gpu_y)) {{
        return;
    }}
    gpu_y[i] = forward_activate(gpu_y[i]);
}}
"
    )
}

/// Generates the WGSL module of the backward kernel of `kind`.
pub fn backward_module(kind: ActivationKind) -> String {
    let expr = source(kind).backward;
    let entry = backward_entry(kind);
    let workgroup = WORKGROUP_SIZE;
    let stride = ROW_STRIDE;

    format!(
        r"@group(0) @binding(0) var<storage, read> gpu_y: array<f32>;
@group(0) @binding(1) var<storage, read_write> gpu_gx: array<f32>;

fn backward_activate(gy: f32, y: f32) -> f32 {{
    return {expr};
}}

@compute @workgroup_size({workgroup})
fn {entry}(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.y * {stride}u + gid.x;
    if (i >= arrayLength(&gpu_gx)) {{
        return;
    }}
    gpu_gx[i] = backward_activate(gpu_gx[i], gpu_y[i]);
}}
"
    )
}

/// Workgroup grid covering `len` elements: `(x, y)` group counts.
pub fn dispatch_grid(len: usize) -> (u32, u32) {
    let groups = len.div_ceil(WORKGROUP_SIZE as usize);
    let max = MAX_GROUPS_PER_DIM as usize;
    if groups <= max {
        (groups as u32, 1)
    } else {
        (MAX_GROUPS_PER_DIM, groups.div_ceil(max) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modules_embed_expression_and_entry_point() {
        for kind in ActivationKind::ALL {
            let fwd = forward_module(kind);
            assert!(fwd.contains(source(kind).forward));
            assert!(fwd.contains(&format!("fn {}(", forward_entry(kind))));

            let bwd = backward_module(kind);
            assert!(bwd.contains(source(kind).backward));
            assert!(bwd.contains(&format!("fn {}(", backward_entry(kind))));
            assert!(bwd.contains("var<storage, read> gpu_y"));
        }
    }

    #[test]
    fn entry_points_are_unique_per_kind() {
        let mut names: Vec<String> = ActivationKind::ALL
            .iter()
            .flat_map(|&k| [forward_entry(k), backward_entry(k)])
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ActivationKind::ALL.len() * 2);
    }

    #[test]
    fn grid_covers_every_element() {
        assert_eq!(dispatch_grid(0), (0, 1));
        assert_eq!(dispatch_grid(1), (1, 1));
        assert_eq!(dispatch_grid(64), (1, 1));
        assert_eq!(dispatch_grid(65), (2, 1));

        let big = ROW_STRIDE as usize + 1;
        let (x, y) = dispatch_grid(big);
        assert_eq!((x, y), (MAX_GROUPS_PER_DIM, 2));
        assert!((x as usize * y as usize * WORKGROUP_SIZE as usize) >= big);
    }
}
