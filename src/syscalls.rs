//! Per-thread syscall activity.
//!
//! `syscall_counts` is a windowed accumulator: it is drained and cleared every
//! cycle. `syscall_counts_stacks` holds one row per sampled event and is only
//! read.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};
use syscalls::Sysno;

use crate::error::Result;
use crate::records::{SyscallCounter, SyscallKey, SyscallStackSample};
use crate::symbolize::{FrameStyle, StackResolver};
use crate::table::ProbeTable;

const CLONE3: u64 = 435;
const FRAME_SEPARATOR: &str = "\n\t";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallStat {
    pub name: String,
    pub count: u64,
    pub total_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCount {
    pub stack_trace: Vec<String>,
    pub count: u64,
}

/// Syscall statistics for the last window, keyed by thread id.
pub type SyscallCounts = BTreeMap<u32, Vec<SyscallStat>>;

/// Stack histogram keyed by thread id, then syscall name.
pub type SyscallStacks = BTreeMap<u32, BTreeMap<String, Vec<StackCount>>>;

/// Name of syscall `id` on this architecture, `syscall_<id>` when unknown.
pub fn syscall_name(id: u64) -> String {
    if id == CLONE3 {
        return "clone3".to_string();
    }
    match usize::try_from(id).ok().and_then(Sysno::new) {
        Some(sysno) => sysno.name().to_string(),
        None => format!("syscall_{id}"),
    }
}

/// Read every counter of the current window, then clear the table.
pub fn drain_counts(
    table: &mut dyn ProbeTable<SyscallKey, SyscallCounter>,
) -> Result<SyscallCounts> {
    let mut rows = table.entries()?;
    rows.sort_by_key(|(key, _)| *key);

    let mut counts = SyscallCounts::new();
    for (key, counter) in &rows {
        counts.entry(key.thread_id).or_default().push(SyscallStat {
            name: syscall_name(key.syscall_id as u64),
            count: counter.count,
            total_ns: counter.total_ns,
        });
    }

    table.clear()?;
    debug!(
        "{}: drained {} rows for {} threads",
        table.name(),
        rows.len(),
        counts.len()
    );
    Ok(counts)
}

/// Build a per-thread, per-syscall histogram of the stacks syscalls were
/// issued from.
///
/// Samples are grouped by their symbolized text rather than their stack id,
/// two ids that resolve to the same frames count as one stack.
pub fn drain_stack_samples(
    table: &dyn ProbeTable<u64, SyscallStackSample>,
    resolver: &mut StackResolver<'_>,
) -> Result<SyscallStacks> {
    let mut rows = table.entries()?;
    rows.sort_by_key(|(ts, _)| *ts);

    let mut grouped: BTreeMap<u32, BTreeMap<String, Vec<(String, u64)>>> = BTreeMap::new();
    for (_, sample) in &rows {
        let text = resolver
            .resolve_marked(sample.stack_id, FrameStyle::Function)
            .join(FRAME_SEPARATOR);
        let bucket = grouped
            .entry(sample.thread_id())
            .or_default()
            .entry(syscall_name(sample.syscall_id))
            .or_default();
        match bucket.iter_mut().find(|(t, _)| *t == text) {
            Some((_, count)) => *count += 1,
            None => bucket.push((text, 1)),
        }
    }

    debug!("{}: {} samples", table.name(), rows.len());
    Ok(grouped
        .into_iter()
        .map(|(tid, per_syscall)| {
            let per_syscall = per_syscall
                .into_iter()
                .map(|(name, stacks)| {
                    let stacks = stacks
                        .into_iter()
                        .map(|(text, count)| StackCount {
                            stack_trace: text.split(FRAME_SEPARATOR).map(str::to_string).collect(),
                            count,
                        })
                        .collect();
                    (name, stacks)
                })
                .collect();
            (tid, per_syscall)
        })
        .collect())
}
