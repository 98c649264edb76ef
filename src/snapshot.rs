//! The per-cycle snapshot document, its JSON writer and console rendering.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::combined::MemoryLedger;
use crate::error::Result;
use crate::kernel_cache::KernelCacheEntry;
use crate::outstanding::{OutstandingReport, OutstandingStack};
use crate::syscalls::{SyscallCounts, SyscallStacks};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(flatten)]
    pub ledger: MemoryLedger,
    pub outstanding: Vec<OutstandingStack>,
}

/// Everything harvested in one cycle. Optional sections are only present when
/// the matching collection is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Milliseconds since the epoch.
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_stats: Option<MemoryStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_caches: Option<Vec<KernelCacheEntry>>,
    pub syscalls: SyscallCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscall_details: Option<SyscallStacks>,
}

/// Create `{dir}/{prefix}.{ext}`, or `{dir}/{prefix}_{n}.{ext}` with the
/// smallest free `n >= 1` if that exists.
pub fn create_unique(dir: &Path, prefix: &str, ext: &str) -> io::Result<(PathBuf, File)> {
    let mut index = 0usize;
    loop {
        let path = if index == 0 {
            dir.join(format!("{prefix}.{ext}"))
        } else {
            dir.join(format!("{prefix}_{index}.{ext}"))
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => index += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Persists snapshots as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    prefix: String,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        SnapshotWriter {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let (path, file) = create_unique(&self.dir, &self.prefix, "json")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
        info!("wrote snapshot {}", path.display());
        Ok(path)
    }
}

/// `HH:MM:SS` of the wall clock in UTC.
fn clock_time(epoch_ms: u64) -> String {
    let secs = epoch_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}

/// Human readable rendering of one cycle.
pub struct ConsoleReport<'a> {
    pub snapshot: &'a Snapshot,
    /// Every outstanding group, for the live view.
    pub live: Option<&'a OutstandingReport>,
    pub top: usize,
}

impl ConsoleReport<'_> {
    pub fn render(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "[{} UTC]", clock_time(self.snapshot.time))?;
        if let Some(memory) = &self.snapshot.memory_stats {
            self.render_memory(memory, out)?;
        }
        if let Some(caches) = &self.snapshot.kernel_caches {
            if !caches.is_empty() {
                writeln!(out, "---------------- Kernel Caches ---------------")?;
                for cache in caches {
                    writeln!(
                        out,
                        "Cache {} {} {}",
                        cache.name,
                        cache.outstanding_count(),
                        cache.outstanding_bytes()
                    )?;
                }
            }
        }
        self.render_syscalls(out)?;
        writeln!(out)?;
        out.flush()
    }

    fn render_memory(&self, memory: &MemoryStats, out: &mut impl Write) -> io::Result<()> {
        let ledger = &memory.ledger;
        writeln!(out, "stack traces {}", ledger.stack_table_size)?;
        writeln!(
            out,
            "overall, allocated {:.3} kb in {} allocations",
            ledger.total_net_bytes as f64 / 1024.0,
            ledger.rows
        )?;
        writeln!(out, "Top {} stacks with outstanding allocations:", self.top)?;
        for entry in &ledger.entries {
            writeln!(
                out,
                "\t{} bytes in {} allocations from stack ({} allocs/frees)\n\t\t{}",
                entry.net_bytes(),
                entry.number_of_allocs as i64 - entry.number_of_frees as i64,
                entry.number_of_allocs + entry.number_of_frees,
                entry.stack.join("\n\t\t")
            )?;
        }

        if let Some(live) = self.live {
            writeln!(out, "Outstanding allocations:")?;
            for alloc in live.allocations() {
                writeln!(out, "\taddr = {:#x} size = {}", alloc.address, alloc.size)?;
            }
            for group in live.groups() {
                writeln!(
                    out,
                    "\t{} bytes in {} allocations from stack (first at {:#x})\n\t\t{}",
                    group.size,
                    group.count,
                    group.first_address,
                    group.stack.join("\n\t\t")
                )?;
            }
        }
        writeln!(out, "Top {} stacks with outstanding allocations:", self.top)?;
        // ascending, like the live view
        for stack in memory.outstanding.iter().rev() {
            writeln!(
                out,
                "\t{} bytes in {} allocations from stack\n\t\t{}",
                stack.size,
                stack.count,
                stack.stack.join("\n\t\t")
            )?;
        }
        Ok(())
    }

    fn render_syscalls(&self, out: &mut impl Write) -> io::Result<()> {
        let mut rows: Vec<_> = self.snapshot.syscalls.values().flatten().collect();
        rows.sort_by_key(|stat| std::cmp::Reverse(stat.total_ns));

        writeln!(out, "{:<22} {:>8} {:>16}", "SYSCALL", "COUNT", "TIME (us)")?;
        for stat in rows.into_iter().take(self.top) {
            writeln!(
                out,
                "{:<22} {:>8} {:>16.3}",
                stat.name,
                stat.count,
                stat.total_ns as f64 / 1e3
            )?;
        }
        Ok(())
    }
}
