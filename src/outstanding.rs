//! Live allocations that have not been freed yet, bucketed by call stack.

use std::cmp::Reverse;
use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::{AllocRecord, StackId};
use crate::symbolize::{FrameStyle, StackResolver};
use crate::table::ProbeTable;

/// One entry of the top-K outstanding report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingStack {
    pub stack: Vec<String>,
    pub size: u64,
    pub count: u64,
}

/// All outstanding allocations attributed to one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationGroup {
    pub stack_id: StackId,
    pub stack: Vec<String>,
    pub size: u64,
    pub count: u64,
    /// Address of the first allocation seen from this stack.
    pub first_address: u64,
}

/// A single live allocation that passed the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAllocation {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct OutstandingReport {
    groups: Vec<AllocationGroup>,
    allocations: Vec<LiveAllocation>,
}

impl OutstandingReport {
    /// Every group, ascending by total size.
    pub fn groups(&self) -> &[AllocationGroup] {
        &self.groups
    }

    /// Every allocation that was counted, ascending by size.
    pub fn allocations(&self) -> &[LiveAllocation] {
        &self.allocations
    }

    /// The `top_k` largest groups, largest first.
    pub fn top(&self, top_k: usize) -> Vec<OutstandingStack> {
        let mut groups: Vec<&AllocationGroup> = self.groups.iter().collect();
        groups.sort_by_key(|g| Reverse(g.size));
        groups
            .into_iter()
            .take(top_k)
            .map(|g| OutstandingStack {
                stack: g.stack.clone(),
                size: g.size,
                count: g.count,
            })
            .collect()
    }
}

/// Group every live allocation at least `min_age_ns` old by its stack.
///
/// Allocations whose stack could not be captured are skipped, as are those
/// younger than `min_age_ns` relative to `now_ns` (CLOCK_MONOTONIC, the clock
/// the probe stamps records with).
pub fn collect(
    allocs: &dyn ProbeTable<u64, AllocRecord>,
    resolver: &mut StackResolver<'_>,
    now_ns: u64,
    min_age_ns: u64,
) -> Result<OutstandingReport> {
    let mut rows = allocs.entries()?;
    rows.sort_by_key(|(_, info)| info.size);

    let mut report = OutstandingReport::default();
    let mut index: HashMap<StackId, usize> = HashMap::new();

    for (address, info) in rows {
        if info.stack_id < 0 || now_ns.saturating_sub(info.timestamp_ns) < min_age_ns {
            continue;
        }

        match index.get(&info.stack_id) {
            Some(&i) => {
                let group = &mut report.groups[i];
                group.count += 1;
                group.size += info.size;
            }
            None => {
                index.insert(info.stack_id, report.groups.len());
                report.groups.push(AllocationGroup {
                    stack_id: info.stack_id,
                    stack: resolver.resolve_marked(info.stack_id, FrameStyle::Detailed),
                    size: info.size,
                    count: 1,
                    first_address: address,
                });
            }
        }
        report.allocations.push(LiveAllocation {
            address,
            size: info.size,
        });
    }

    report.groups.sort_by_key(|g| g.size);
    debug!(
        "{}: {} outstanding allocations in {} stacks",
        allocs.name(),
        report.allocations.len(),
        report.groups.len()
    );
    Ok(report)
}
