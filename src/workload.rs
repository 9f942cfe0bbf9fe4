//! Striding-sum demonstration task.

use crate::config::FaultPlan;
use crate::coordinator::{TaskBody, TaskContext};
use anyhow::{Context, bail};
use tracing::info;

/// Sums `chunk` consecutive integers per iteration across the Worker group.
///
/// Iteration `i` loads `i * chunk .. (i + 1) * chunk`; each worker sums its
/// stride partition and the Writer sums the partials.
#[derive(Debug, Clone)]
pub struct StridedSum {
    chunk: usize,
    faults: FaultPlan,
    written: Vec<(usize, i64)>,
}

impl StridedSum {
    /// A task loading `chunk` numbers per iteration.
    pub fn new(chunk: usize) -> Self {
        StridedSum {
            chunk,
            faults: FaultPlan::none(),
            written: Vec::new(),
        }
    }

    /// Arm injected failures.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// `(index, total)` for every iteration this rank wrote.
    pub fn written(&self) -> &[(usize, i64)] {
        &self.written
    }

    /// The total a correct run writes for iteration `index`.
    pub fn expected_total(&self, index: usize) -> anyhow::Result<i64> {
        let (start, end) = self.bounds(index)?;
        checked_sum(start..end)
    }

    fn bounds(&self, index: usize) -> anyhow::Result<(i64, i64)> {
        let chunk = i64::try_from(self.chunk).context("chunk does not fit in i64")?;
        let index = i64::try_from(index).context("iteration index does not fit in i64")?;
        let start = index
            .checked_mul(chunk)
            .with_context(|| format!("iteration {index} with chunk {chunk} overflows i64"))?;
        let end = start
            .checked_add(chunk)
            .with_context(|| format!("iteration {index} with chunk {chunk} overflows i64"))?;
        Ok((start, end))
    }
}

fn checked_sum(values: impl IntoIterator<Item = i64>) -> anyhow::Result<i64> {
    values
        .into_iter()
        .try_fold(0i64, i64::checked_add)
        .context("sum overflows i64")
}

impl TaskBody for StridedSum {
    type Item = i64;
    type Partial = i64;

    fn load(&mut self, ctx: TaskContext) -> anyhow::Result<Vec<i64>> {
        if self.faults.load == Some(ctx.index) {
            bail!("error during load_data");
        }
        let (start, end) = self.bounds(ctx.index)?;
        let numbers: Vec<i64> = (start..end).collect();
        info!(rank = ctx.rank, index = ctx.index, ?numbers, "loaded");
        Ok(numbers)
    }

    fn process(&mut self, ctx: TaskContext, slice: &[i64]) -> anyhow::Result<i64> {
        if self.faults.process == Some(ctx.index) && ctx.rank + 1 == ctx.size {
            bail!("error during process_data");
        }
        let subtotal = checked_sum(slice.iter().copied())?;
        info!(rank = ctx.rank, index = ctx.index, subtotal, "processed");
        Ok(subtotal)
    }

    fn write(&mut self, ctx: TaskContext, partials: Vec<i64>) -> anyhow::Result<()> {
        if self.faults.write == Some(ctx.index) {
            bail!("error during write_result");
        }
        let total = checked_sum(partials)?;
        info!(rank = ctx.rank, index = ctx.index, total, "wrote");
        self.written.push((ctx.index, total));
        Ok(())
    }
}
