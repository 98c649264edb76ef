//! The contract between the harvester and the probe layer's tables.
//!
//! The probe layer is the only inserter; the harvester reads, and for
//! `kernel_cache_counts` and `syscall_counts` deletes. Anything that can
//! iterate, batch-delete and clear satisfies [`ProbeTable`], which is how the
//! reducers are tested without a kernel.

use crate::error::Result;
use crate::records::{
    AllocRecord, CacheCounter, CacheName, CombinedAlloc, StackId, SyscallCounter, SyscallKey,
    SyscallStackSample,
};

pub trait ProbeTable<K, V> {
    /// Table name, used in errors and logs.
    fn name(&self) -> &'static str;
    /// Snapshot of every row at call time.
    fn entries(&self) -> Result<Vec<(K, V)>>;
    fn delete_batch(&mut self, keys: &[K]) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

pub trait StackTraceTable {
    /// Frame addresses recorded for `stack_id`, innermost frame first.
    ///
    /// Returns `Ok(None)` when the id is unknown, which happens once the
    /// kernel has recycled the slot.
    fn walk(&self, stack_id: StackId) -> Result<Option<Vec<u64>>>;
    fn len(&self) -> Result<usize>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Every table the probe layer may expose. Memory tables are only present when
/// the memory probes were attached, the stack sample table only when syscall
/// stacks are collected.
pub struct ProbeTables {
    pub stack_traces: Box<dyn StackTraceTable>,
    pub allocs: Option<Box<dyn ProbeTable<u64, AllocRecord>>>,
    pub combined_allocs: Option<Box<dyn ProbeTable<StackId, CombinedAlloc>>>,
    pub kernel_cache_counts: Option<Box<dyn ProbeTable<CacheName, CacheCounter>>>,
    pub syscall_counts: Box<dyn ProbeTable<SyscallKey, SyscallCounter>>,
    pub syscall_counts_stacks: Option<Box<dyn ProbeTable<u64, SyscallStackSample>>>,
}

/// An attached set of probes together with the tables they fill.
pub trait ProbeSession {
    fn tables(&mut self) -> &mut ProbeTables;
    /// Release all kernel-side resources. Called exactly once by the harvester.
    fn detach(&mut self);
}

/// Insertion-ordered in-memory table.
#[derive(Debug, Clone)]
pub struct MemTable<K, V> {
    name: &'static str,
    rows: Vec<(K, V)>,
}

impl<K: PartialEq + Clone, V: Clone> MemTable<K, V> {
    pub fn new(name: &'static str) -> Self {
        MemTable {
            name,
            rows: Vec::new(),
        }
    }

    /// Insert or overwrite a row. New keys go to the end of the iteration order.
    pub fn insert(&mut self, key: K, value: V) {
        match self.rows.iter_mut().find(|(k, _)| *k == key) {
            Some(row) => row.1 = value,
            None => self.rows.push((key, value)),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.rows.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<K: PartialEq + Clone, V: Clone> ProbeTable<K, V> for MemTable<K, V> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn entries(&self) -> Result<Vec<(K, V)>> {
        Ok(self.rows.clone())
    }

    fn delete_batch(&mut self, keys: &[K]) -> Result<()> {
        self.rows.retain(|(k, _)| !keys.contains(k));
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemStackTraces {
    stacks: Vec<(StackId, Vec<u64>)>,
}

impl MemStackTraces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stack_id: StackId, frames: Vec<u64>) {
        self.stacks.retain(|(id, _)| *id != stack_id);
        self.stacks.push((stack_id, frames));
    }

    /// Drop a stack the way the kernel does when it recycles a bucket.
    pub fn evict(&mut self, stack_id: StackId) {
        self.stacks.retain(|(id, _)| *id != stack_id);
    }
}

impl StackTraceTable for MemStackTraces {
    fn walk(&self, stack_id: StackId) -> Result<Option<Vec<u64>>> {
        Ok(self
            .stacks
            .iter()
            .find(|(id, _)| *id == stack_id)
            .map(|(_, frames)| frames.clone()))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.stacks.len())
    }
}

/// A [`ProbeSession`] over in-memory tables, for dry runs and tests.
pub struct MemProbes {
    pub tables: ProbeTables,
    pub detach_count: usize,
}

impl MemProbes {
    pub fn new(tables: ProbeTables) -> Self {
        MemProbes {
            tables,
            detach_count: 0,
        }
    }
}

impl ProbeSession for MemProbes {
    fn tables(&mut self) -> &mut ProbeTables {
        &mut self.tables
    }

    fn detach(&mut self) {
        self.detach_count += 1;
    }
}
