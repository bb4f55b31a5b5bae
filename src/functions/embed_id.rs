//! Embedding lookup.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::Real;
use crate::error::Result;
use crate::functions::{Context, Function, FunctionId, check_gradient, index_of};
use crate::tensors::{BatchArray, WithGrad};

/// Maps integer ids to rows of a `[vocab, units]` weight matrix.
///
/// Input values are read as ids. An input of shape `s` produces an output of
/// shape `s ++ [units]`; the batch count is unchanged. Ids are not
/// differentiable, so backward only accumulates the weight gradient and
/// returns zeros for the input.
#[derive(Debug)]
pub struct EmbedID {
    name: String,
    id: FunctionId,
    vocab: usize,
    units: usize,
    weight: WithGrad<BatchArray>,
}

impl EmbedID {
    /// An embedding with weights drawn from `N(0, 1)`.
    pub fn new(name: impl Into<String>, vocab: usize, units: usize) -> Self {
        Self::with_rng(name, vocab, units, &mut rand::rng())
    }

    /// Same as [`EmbedID::new`], drawing the weights from `rng`.
    ///
    /// # Panics
    /// Panics if `vocab * units` overflows `usize`.
    pub fn with_rng<R: Rng>(name: impl Into<String>, vocab: usize, units: usize, rng: &mut R) -> Self {
        let Some(count) = vocab.checked_mul(units) else {
            panic!("a {vocab}x{units} embedding table does not fit in memory");
        };
        let weights = (0..count).map(|_| rng.sample(StandardNormal)).collect();
        let weight = WithGrad::new(BatchArray::from_parts(weights, vec![vocab, units], 1));
        Self {
            name: name.into(),
            id: FunctionId::next(),
            vocab,
            units,
            weight,
        }
    }

    /// An embedding with the given row-major `[vocab, units]` weights.
    ///
    /// # Errors
    /// Returns [`NnError::ShapeMismatch`](crate::error::NnError::ShapeMismatch) if
    /// `weights` has the wrong length.
    pub fn with_weights(
        name: impl Into<String>,
        vocab: usize,
        units: usize,
        weights: Vec<Real>,
    ) -> Result<Self> {
        let weight = BatchArray::new(weights, vec![vocab, units], 1)?;
        Ok(Self {
            name: name.into(),
            id: FunctionId::next(),
            vocab,
            units,
            weight: WithGrad::new(weight),
        })
    }

    /// Number of distinct ids.
    pub fn vocab_size(&self) -> usize {
        self.vocab
    }

    /// Width of one embedding row.
    pub fn units(&self) -> usize {
        self.units
    }

    /// The weight and its gradient.
    pub fn weight(&self) -> &WithGrad<BatchArray> {
        &self.weight
    }

    fn row_of(&self, value: Real) -> Result<usize> {
        index_of(value, self.vocab)
    }

    fn output_shape(&self, x: &BatchArray) -> Vec<usize> {
        let mut shape = x.shape().to_vec();
        shape.push(self.units);
        shape
    }
}

impl Function for EmbedID {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn forward(&self, x: &BatchArray) -> Result<(BatchArray, Context)> {
        let table = self.weight.value.data();
        let mut y = Vec::with_capacity(x.len() * self.units);
        for &v in x.data() {
            let row = self.row_of(v)?;
            y.extend_from_slice(&table[row * self.units..(row + 1) * self.units]);
        }

        let y = BatchArray::new(y, self.output_shape(x), x.batch_count())?;
        Ok((y, Context::new(self.id, x.clone())))
    }

    fn backward(&mut self, gy: &BatchArray, ctx: Context) -> Result<BatchArray> {
        let x = ctx.claim(self.id)?;
        check_gradient(gy, &self.output_shape(&x), x.batch_count())?;

        let units = self.units;
        for (&v, g) in x.data().iter().zip(gy.data().chunks(units.max(1))) {
            let row = self.row_of(v)?;
            let acc = &mut self.weight.grad.data_mut()[row * units..(row + 1) * units];
            for (a, g) in acc.iter_mut().zip(g) {
                *a += g;
            }
        }

        Ok(x.zeros_like())
    }

    fn parameters(&self) -> Vec<&WithGrad<BatchArray>> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut WithGrad<BatchArray>> {
        vec![&mut self.weight]
    }
}
