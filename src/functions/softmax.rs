//! Softmax over each batch entry.

use crate::error::Result;
use crate::functions::{Context, Function, FunctionId, check_gradient};
use crate::ops::cpu;
use crate::tensors::BatchArray;

/// Normalizes every batch entry into a probability distribution.
///
/// The whole entry (its full volume) is one distribution. The forward output
/// is saved for backward.
#[derive(Debug)]
pub struct Softmax {
    name: String,
    id: FunctionId,
}

impl Softmax {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: FunctionId::next(),
        }
    }
}

impl Function for Softmax {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn forward(&self, x: &BatchArray) -> Result<(BatchArray, Context)> {
        let y = cpu::softmax_rows(x.data(), x.volume());
        let y = BatchArray::convert(y, x.shape(), x.batch_count())?;
        Ok((y.clone(), Context::new(self.id, y)))
    }

    fn backward(&mut self, gy: &BatchArray, ctx: Context) -> Result<BatchArray> {
        let y = ctx.claim(self.id)?;
        check_gradient(gy, y.shape(), y.batch_count())?;

        let gx = cpu::softmax_rows_backward(gy.data(), y.data(), y.volume());
        BatchArray::convert(gx, y.shape(), y.batch_count())
    }
}
