//! Reduction of the cumulative per-stack alloc/free ledger.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::{CombinedAlloc, StackId};
use crate::symbolize::{FrameStyle, StackResolver};
use crate::table::ProbeTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub alloc_size: u64,
    pub free_size: u64,
    pub number_of_allocs: u64,
    pub number_of_frees: u64,
    #[serde(rename = "trace")]
    pub stack: Vec<String>,
}

impl LedgerEntry {
    pub fn net_bytes(&self) -> i64 {
        (self.alloc_size as i64).wrapping_sub(self.free_size as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLedger {
    /// Sum of `alloc_size - free_size` over every row, in bytes.
    #[serde(rename = "memory")]
    pub total_net_bytes: i64,
    /// Number of rows the total was computed over.
    #[serde(skip)]
    pub rows: usize,
    /// Largest net consumers first.
    #[serde(rename = "combined_allocs")]
    pub entries: Vec<LedgerEntry>,
    #[serde(rename = "stack_traces")]
    pub stack_table_size: usize,
}

/// Reduce `combined_allocs` into a global net total and the `top_k` stacks
/// holding the most unreleased bytes.
pub fn reduce(
    table: &dyn ProbeTable<StackId, CombinedAlloc>,
    resolver: &mut StackResolver<'_>,
    top_k: usize,
) -> Result<MemoryLedger> {
    let mut rows = table.entries()?;
    rows.sort_by_key(|(_, row)| row.net_bytes());

    let total_net_bytes = rows
        .iter()
        .fold(0i64, |acc, (_, row)| acc.wrapping_add(row.net_bytes()));

    let skip = rows.len().saturating_sub(top_k);
    let entries = rows[skip..]
        .iter()
        .rev()
        .map(|(stack_id, row)| LedgerEntry {
            alloc_size: row.alloc_size,
            free_size: row.free_size,
            number_of_allocs: row.number_of_allocs,
            number_of_frees: row.number_of_frees,
            stack: resolver.resolve_marked(*stack_id, FrameStyle::Function),
        })
        .collect();

    let stack_table_size = resolver.stack_table_size()?;
    debug!(
        "{}: {} rows, net {} bytes, {} stacks",
        table.name(),
        rows.len(),
        total_net_bytes,
        stack_table_size
    );

    Ok(MemoryLedger {
        total_net_bytes,
        rows: rows.len(),
        entries,
        stack_table_size,
    })
}
