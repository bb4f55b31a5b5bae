//! Backend selection module.
//!
//! This module defines the available execution backends and provides functions
//! to set and get the process default.
//!
//! # Supported Backends
//!
//! - `Cpu`: sequential per-element loops on the calling thread (default).
//! - `Wgpu`: GPU-accelerated kernels using `wgpu` (requires the `wgpu` feature).
//!
//! The default is stored globally using an `AtomicU8`. It is read when an
//! activation is constructed without an explicit backend or executor; changing
//! it later does not affect functions that already exist.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::BackendError;
use crate::ops::Executor;
use crate::ops::cpu::CpuExecutor;

/// Enumeration of supported execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Pure CPU execution (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated execution using `wgpu`.
    Wgpu = 1,
}

impl Backend {
    /// Returns `true` if this backend was compiled into the crate.
    pub const fn is_available(self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
        }
    }

    /// Builds the executor that runs elementwise work on this backend.
    ///
    /// For `Wgpu` this initializes the shared [`Weaver`](crate::ops::wgpu::Weaver)
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] if the backend was not compiled in,
    /// or the initialization error of the GPU context.
    pub fn executor(self) -> Result<Arc<dyn Executor>, BackendError> {
        match self {
            Self::Cpu => Ok(Arc::new(CpuExecutor)),
            #[cfg(feature = "wgpu")]
            Self::Wgpu => Ok(Arc::new(crate::ops::wgpu::WgpuExecutor::global()?)),
            #[cfg(not(feature = "wgpu"))]
            Self::Wgpu => Err(BackendError::Unavailable(self)),
        }
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Internal global state for the default backend.
///
/// Relaxed ordering is enough: the value only seeds newly constructed functions.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the default backend for functions constructed afterwards.
///
/// # Example
/// ```
/// use briny_chain::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Relaxed);
}

/// Returns the current default backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Relaxed)).unwrap_or_default()
}
