/// Bytes a structure holds in live entries vs. what its containers have
/// reserved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used: usize,
    pub allocated: usize,
}

impl MemoryUsage {
    pub fn add<T>(&mut self, v: &Vec<T>) {
        self.used += v.len() * std::mem::size_of::<T>();
        self.allocated += v.capacity() * std::mem::size_of::<T>();
    }
}

/// Shape summary of a built tree, for introspection and builder tuning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub nodes: usize,
    pub leaves: usize,
    pub object_refs: usize,
    pub max_leaf_size: usize,
    pub max_depth: usize,
}

impl TreeStats {
    pub fn record_leaf(&mut self, size: usize, depth: usize) {
        self.leaves += 1;
        self.max_leaf_size = self.max_leaf_size.max(size);
        self.max_depth = self.max_depth.max(depth);
    }
}
