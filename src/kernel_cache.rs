//! Slab caches the target is putting pressure on.
//!
//! `kernel_cache_counts` is shared with the probe, which only ever inserts.
//! Rows whose frees have caught up with their allocations are purged here so
//! the table does not fill up with caches that are long balanced. A purged
//! name seen again later starts a fresh row on the probe side.

use std::cmp::Reverse;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::{CacheCounter, CacheName};
use crate::table::ProbeTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelCacheEntry {
    pub name: String,
    pub alloc_count: u64,
    pub free_count: u64,
    pub alloc_size: u64,
    pub free_size: u64,
}

impl KernelCacheEntry {
    fn new(name: &CacheName, counter: &CacheCounter) -> Self {
        KernelCacheEntry {
            name: name.name(),
            alloc_count: counter.alloc_count,
            free_count: counter.free_count,
            alloc_size: counter.alloc_size,
            free_size: counter.free_size,
        }
    }

    /// Bytes held by the cache on behalf of the target.
    pub fn outstanding_bytes(&self) -> u64 {
        self.alloc_size.saturating_sub(self.free_size)
    }

    pub fn outstanding_count(&self) -> i64 {
        (self.alloc_count as i64).wrapping_sub(self.free_count as i64)
    }
}

/// Report caches with positive pressure, largest first, and purge reconciled
/// rows.
///
/// When no cache shows pressure the table is left untouched and the report
/// is empty.
pub fn reduce(
    table: &mut dyn ProbeTable<CacheName, CacheCounter>,
    top_k: usize,
) -> Result<Vec<KernelCacheEntry>> {
    let rows = table.entries()?;

    let mut pressured: Vec<&(CacheName, CacheCounter)> =
        rows.iter().filter(|(_, c)| c.has_pressure()).collect();
    if pressured.is_empty() {
        return Ok(Vec::new());
    }
    pressured.sort_by_key(|(_, c)| Reverse(c.alloc_size - c.free_size));

    let report: Vec<KernelCacheEntry> = pressured
        .into_iter()
        .take(top_k)
        .map(|(name, counter)| KernelCacheEntry::new(name, counter))
        .collect();

    let reconciled: Vec<CacheName> = rows
        .iter()
        .filter(|(_, c)| c.is_reconciled())
        .map(|(name, _)| *name)
        .collect();
    if !reconciled.is_empty() {
        debug!("{}: purging {} reconciled caches", table.name(), reconciled.len());
        table.delete_batch(&reconciled)?;
    }

    Ok(report)
}
