//! Stride partitioning of a sequence across workers.
//!
//! Worker `r` of `w` owns positions `{r, r + w, r + 2w, …}`. Partitions are
//! disjoint, cover the whole sequence, and [`interleave`] puts them back in
//! the original order.

/// The slice of a sequence owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridePartition {
    /// Worker index within the group.
    pub index: usize,
    /// Number of workers.
    pub count: usize,
}

impl StridePartition {
    /// Partition owned by worker `index` of `count`.
    pub fn new(index: usize, count: usize) -> Self {
        StridePartition { index, count }
    }

    /// Copy out this worker's elements, in their original relative order.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        stride(items, self.index, self.count)
    }

    /// How many of `n` elements this worker owns.
    pub fn len_for(&self, n: usize) -> usize {
        if self.count == 0 || self.index >= n {
            0
        } else {
            (n - self.index).div_ceil(self.count)
        }
    }
}

/// Elements of `items` at positions `index, index + count, …`.
///
/// An empty group (`count == 0`) owns nothing.
pub fn stride<T: Clone>(items: &[T], index: usize, count: usize) -> Vec<T> {
    if count == 0 {
        return Vec::new();
    }
    items.iter().skip(index).step_by(count).cloned().collect()
}

/// Reassemble per-worker stride partitions given in worker order.
pub fn interleave<T>(parts: Vec<Vec<T>>) -> Vec<T> {
    let total = parts.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = parts.into_iter().map(Vec::into_iter).collect();
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for it in &mut iters {
            if let Some(item) = it.next() {
                out.push(item);
            }
        }
    }
    out
}
