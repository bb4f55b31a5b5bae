//! Core numeric container and gradient wrapper.
//!
//! # Batch Arrays
//!
//! A [`BatchArray`] holds a flat row-major buffer of [`Real`] values together
//! with a shape (the dimensions of one entry, excluding the batch) and a batch
//! count. Every function consumes and produces batch arrays.
//!
//! ## Design Highlights
//! - `data.len() == volume(shape) * batch_count` is checked on construction
//! - An empty shape describes one scalar per batch entry
//! - Functions never mutate their inputs; they return new arrays
//! - `WithGrad<T>` pairs a trainable value with its accumulated gradient
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting or slicing beyond whole batch entries
//!
//! ## Example
//!
//! ```rust
//! use briny_chain::tensors::BatchArray;
//! let a = BatchArray::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3], 2).unwrap();
//! assert_eq!(a.shape(), &[3]);
//! assert_eq!(a.batch(1), &[4.0, 5.0, 6.0]);
//! ```

use core::ops::Add;

use crate::Real;
use crate::error::{NnError, Result};

/// Product of the dimensions of `shape`; `1` for an empty shape.
///
/// Returns `None` if the product overflows `usize`.
pub fn volume(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

// element count of a layout; overflow saturates so it never matches a buffer
fn expected_len(shape: &[usize], batch_count: usize) -> usize {
    volume(shape)
        .and_then(|v| v.checked_mul(batch_count))
        .unwrap_or(usize::MAX)
}

/// Represents a batch of equally shaped entries stored in one flat buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchArray {
    data: Vec<Real>,
    shape: Vec<usize>,
    batch_count: usize,
}

impl BatchArray {
    /// Creates a batch array from a flat buffer, the shape of one entry and
    /// the number of entries.
    ///
    /// # Errors
    /// Returns [`NnError::ShapeMismatch`] if `data.len()` is not
    /// `volume(shape) * batch_count`, or if that product overflows `usize`
    /// (reported as an expected length of `usize::MAX`).
    pub fn new(data: Vec<Real>, shape: impl Into<Vec<usize>>, batch_count: usize) -> Result<Self> {
        let shape = shape.into();
        let expected = expected_len(&shape, batch_count);
        if data.len() != expected || expected == usize::MAX {
            return Err(NnError::ShapeMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            shape,
            batch_count,
        })
    }

    /// Wraps a flat buffer produced by an operation with an existing layout.
    ///
    /// Same checks as [`BatchArray::new`].
    ///
    /// # Errors
    /// Returns [`NnError::ShapeMismatch`] on a length mismatch.
    pub fn convert(data: Vec<Real>, shape: &[usize], batch_count: usize) -> Result<Self> {
        Self::new(data, shape.to_vec(), batch_count)
    }

    /// A single one-dimensional entry holding `data`.
    pub fn from_vec(data: Vec<Real>) -> Self {
        let shape = vec![data.len()];
        Self {
            data,
            shape,
            batch_count: 1,
        }
    }

    /// A zero-filled array with the given layout.
    ///
    /// # Errors
    /// Returns [`NnError::ShapeMismatch`] if the element count overflows `usize`.
    pub fn zeros(shape: impl Into<Vec<usize>>, batch_count: usize) -> Result<Self> {
        let shape = shape.into();
        let len = expected_len(&shape, batch_count);
        if len == usize::MAX {
            return Err(NnError::ShapeMismatch {
                expected: len,
                got: 0,
            });
        }
        Ok(Self {
            data: vec![0.0; len],
            shape,
            batch_count,
        })
    }

    /// A zero-filled array with the same layout as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::from_parts(vec![0.0; self.len()], self.shape.clone(), self.batch_count)
    }

    // caller guarantees `data.len() == volume(shape) * batch_count`
    pub(crate) fn from_parts(data: Vec<Real>, shape: Vec<usize>, batch_count: usize) -> Self {
        debug_assert_eq!(data.len(), expected_len(&shape, batch_count));
        Self {
            data,
            shape,
            batch_count,
        }
    }

    /// The flat buffer.
    pub fn data(&self) -> &[Real] {
        &self.data
    }

    /// Mutable access to the flat buffer; the layout cannot change through it.
    ///
    /// Meant for parameters and optimizers, which update values in place.
    pub fn data_mut(&mut self) -> &mut [Real] {
        &mut self.data
    }

    /// Consumes the array and returns its flat buffer.
    pub fn into_data(self) -> Vec<Real> {
        self.data
    }

    /// The shape of one batch entry.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The number of batch entries.
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// The number of elements in one batch entry.
    pub fn volume(&self) -> usize {
        // checked on construction
        self.shape.iter().product()
    }

    /// The total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The elements of batch entry `i`.
    ///
    /// # Panics
    /// Panics if `i >= batch_count`.
    pub fn batch(&self, i: usize) -> &[Real] {
        let v = self.volume();
        &self.data[i * v..(i + 1) * v]
    }

    /// Returns `true` if both arrays have the same shape and batch count.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.shape == other.shape && self.batch_count == other.batch_count
    }

    /// Adds two arrays element-wise.
    ///
    /// # Errors
    /// Returns [`NnError::DimensionMismatch`] if the layouts differ.
    pub fn add(&self, other: &Self) -> Result<Self> {
        if !self.same_layout(other) {
            return Err(NnError::DimensionMismatch {
                expected: layout(self),
                got: layout(other),
            });
        }
        Ok(Self {
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect(),
            shape: self.shape.clone(),
            batch_count: self.batch_count,
        })
    }
}

// shape followed by the batch count, for error reporting
fn layout(a: &BatchArray) -> Vec<usize> {
    let mut l = a.shape.clone();
    l.push(a.batch_count);
    l
}

impl Add for &BatchArray {
    type Output = BatchArray;

    /// # Panics
    /// Panics if the layouts differ; use [`BatchArray::add`] to get an error instead.
    fn add(self, rhs: Self) -> BatchArray {
        match BatchArray::add(self, rhs) {
            Ok(sum) => sum,
            Err(e) => panic!("{e}"),
        }
    }
}

/// A container for a trainable value and its accumulated gradient.
///
/// Typically used as `WithGrad<BatchArray>`.
#[derive(Debug, Clone, PartialEq)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl WithGrad<BatchArray> {
    /// Wraps `value` with a zero gradient of the same layout.
    pub fn new(value: BatchArray) -> Self {
        let grad = value.zeros_like();
        Self { value, grad }
    }

    /// Resets the accumulated gradient to zero.
    pub fn zero_grad(&mut self) {
        self.grad.data_mut().fill(0.0);
    }

    /// Borrows the value mutably and the gradient immutably at once.
    pub fn split_mut(&mut self) -> (&mut BatchArray, &BatchArray) {
        (&mut self.value, &self.grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_must_match_layout() {
        let err = BatchArray::new(vec![1.0, 2.0, 3.0], vec![2], 2).unwrap_err();
        assert_eq!(err, NnError::ShapeMismatch { expected: 4, got: 3 });
    }

    #[test]
    fn overflowing_layout_is_a_shape_error() {
        let err = BatchArray::new(vec![1.0], vec![usize::MAX, 2], 1).unwrap_err();
        assert_eq!(err, NnError::ShapeMismatch { expected: usize::MAX, got: 1 });

        let err = BatchArray::new(vec![1.0], vec![usize::MAX], 2).unwrap_err();
        assert!(matches!(err, NnError::ShapeMismatch { .. }));

        assert!(BatchArray::zeros(vec![usize::MAX / 2, 3], 1).is_err());
        assert_eq!(volume(&[usize::MAX, 2]), None);
        assert_eq!(volume(&[3, 4]), Some(12));
    }

    #[test]
    fn empty_shape_is_one_scalar_per_entry() {
        let a = BatchArray::new(vec![1.0, 2.0], Vec::new(), 2).unwrap();
        assert_eq!(a.volume(), 1);
        assert_eq!(a.batch(1), &[2.0]);
    }

    #[test]
    fn add_requires_same_layout() {
        let a = BatchArray::new(vec![1.0, 2.0, 3.0, 4.0], vec![2], 2).unwrap();
        let b = BatchArray::new(vec![1.0, 2.0, 3.0, 4.0], vec![4], 1).unwrap();
        assert!(matches!(a.add(&b), Err(NnError::DimensionMismatch { .. })));

        let sum = &a + &a;
        assert_eq!(sum.data(), &[2.0, 4.0, 6.0, 8.0]);
        assert!(sum.same_layout(&a));
    }

    #[test]
    fn zero_grad_clears_gradient() {
        let mut w = WithGrad::new(BatchArray::from_vec(vec![1.0, 2.0]));
        w.grad.data_mut().copy_from_slice(&[0.5, 0.25]);
        w.zero_grad();
        assert_eq!(w.grad.data(), &[0.0, 0.0]);
        assert_eq!(w.value.data(), &[1.0, 2.0]);
    }
}
