//! Common test utilities for allocwatch integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use allocwatch::records::{
    AllocRecord, CacheCounter, CacheName, CombinedAlloc, SyscallCounter, SyscallKey,
    SyscallStackSample,
};
use allocwatch::table::{MemProbes, MemStackTraces, MemTable, ProbeTable, ProbeTables};
use allocwatch::{FrameStyle, HarvestError, Handshake, Symbolize};
use syscalls::Sysno;

/// Names every frame `frame_<hex addr>`.
pub struct StaticSymbolizer;

impl Symbolize for StaticSymbolizer {
    fn symbolize(&mut self, _pid: u32, addrs: &[u64], style: FrameStyle) -> Vec<String> {
        addrs
            .iter()
            .map(|addr| match style {
                FrameStyle::Detailed => format!("0x{addr:016x} app!frame_{addr:x}+0x0"),
                FrameStyle::Function => format!("frame_{addr:x}+0x0"),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Ready(u32),
    Complete(u32),
}

/// Records handshake notifications instead of sending signals.
#[derive(Clone, Default)]
pub struct RecordingHandshake {
    pub sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingHandshake {
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Handshake for RecordingHandshake {
    fn ready(&mut self, pid: u32) -> allocwatch::Result<()> {
        self.sent.lock().unwrap().push(Notification::Ready(pid));
        Ok(())
    }

    fn complete(&mut self, pid: u32) -> allocwatch::Result<()> {
        self.sent.lock().unwrap().push(Notification::Complete(pid));
        Ok(())
    }
}

/// Which call of a [`FailingTable`] returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Entries,
    Clear,
}

/// A table whose kernel side has gone away.
pub struct FailingTable {
    pub name: &'static str,
    pub fail_on: FailOn,
}

impl FailingTable {
    fn error(&self) -> HarvestError {
        HarvestError::TableAccess {
            table: self.name,
            source: libbpf_rs::Error::from_raw_os_error(libc::EBADF),
        }
    }
}

impl<K, V> ProbeTable<K, V> for FailingTable {
    fn name(&self) -> &'static str {
        self.name
    }

    fn entries(&self) -> allocwatch::Result<Vec<(K, V)>> {
        match self.fail_on {
            FailOn::Entries => Err(self.error()),
            FailOn::Clear => Ok(Vec::new()),
        }
    }

    fn delete_batch(&mut self, _keys: &[K]) -> allocwatch::Result<()> {
        Err(self.error())
    }

    fn clear(&mut self) -> allocwatch::Result<()> {
        Err(self.error())
    }
}

/// Thread id every fixture row belongs to.
pub const THREAD_ID: u32 = 11;

/// Tables as a process with two call sites and some slab activity leaves them.
pub fn populated_probes() -> MemProbes {
    MemProbes::new(populated_tables(false))
}

/// [`populated_probes`] plus two `read` samples in `syscall_counts_stacks`
/// whose stack ids differ but hold the same frames.
pub fn populated_probes_with_syscall_stacks() -> MemProbes {
    MemProbes::new(populated_tables(true))
}

fn populated_tables(with_samples: bool) -> ProbeTables {
    let mut stacks = MemStackTraces::new();
    stacks.insert(1, vec![0x100, 0x200]);
    stacks.insert(2, vec![0x300]);

    let mut allocs = MemTable::new("allocs");
    allocs.insert(
        0x7000,
        AllocRecord {
            size: 256,
            timestamp_ns: 0,
            stack_id: 1,
        },
    );
    allocs.insert(
        0x8000,
        AllocRecord {
            size: 64,
            timestamp_ns: 0,
            stack_id: 2,
        },
    );
    // Stack id lost by the probe, never reported.
    allocs.insert(
        0x9000,
        AllocRecord {
            size: 4096,
            timestamp_ns: 0,
            stack_id: -14,
        },
    );

    let mut combined = MemTable::new("combined_allocs");
    combined.insert(
        1,
        CombinedAlloc {
            alloc_size: 1024,
            free_size: 256,
            number_of_allocs: 4,
            number_of_frees: 1,
        },
    );
    combined.insert(
        2,
        CombinedAlloc {
            alloc_size: 128,
            free_size: 64,
            number_of_allocs: 2,
            number_of_frees: 1,
        },
    );

    let mut caches = MemTable::new("kernel_cache_counts");
    caches.insert(
        CacheName::new("dentry"),
        CacheCounter {
            alloc_count: 10,
            alloc_size: 1920,
            free_count: 10,
            free_size: 1920,
        },
    );
    caches.insert(
        CacheName::new("kmalloc-64"),
        CacheCounter {
            alloc_count: 5,
            alloc_size: 320,
            free_count: 2,
            free_size: 128,
        },
    );

    let mut syscalls = MemTable::new("syscall_counts");
    syscalls.insert(
        SyscallKey::new(Sysno::read.id() as u32, THREAD_ID),
        SyscallCounter {
            count: 3,
            total_ns: 3000,
        },
    );
    syscalls.insert(
        SyscallKey::new(Sysno::write.id() as u32, THREAD_ID),
        SyscallCounter {
            count: 1,
            total_ns: 500,
        },
    );

    let syscall_counts_stacks = with_samples.then(|| {
        stacks.insert(3, vec![0x500]);
        stacks.insert(4, vec![0x500]);
        let mut samples = MemTable::new("syscall_counts_stacks");
        for (ts, stack_id) in [(1_000u64, 3), (2_000, 4)] {
            samples.insert(
                ts,
                SyscallStackSample {
                    pid_tgid: (4242u64 << 32) | THREAD_ID as u64,
                    syscall_id: Sysno::read.id() as u64,
                    stack_id,
                },
            );
        }
        Box::new(samples) as Box<dyn ProbeTable<u64, SyscallStackSample>>
    });

    ProbeTables {
        stack_traces: Box::new(stacks),
        allocs: Some(Box::new(allocs)),
        combined_allocs: Some(Box::new(combined)),
        kernel_cache_counts: Some(Box::new(caches)),
        syscall_counts: Box::new(syscalls),
        syscall_counts_stacks,
    }
}

/// Tables with nothing in them, as right after attach.
pub fn empty_probes() -> MemProbes {
    MemProbes::new(ProbeTables {
        stack_traces: Box::new(MemStackTraces::new()),
        allocs: None,
        combined_allocs: None,
        kernel_cache_counts: None,
        syscall_counts: Box::new(MemTable::new("syscall_counts")),
        syscall_counts_stacks: None,
    })
}

/// Empty tables except for a `syscall_counts` that fails on `fail_on`.
pub fn failing_probes(fail_on: FailOn) -> MemProbes {
    let mut probes = empty_probes();
    probes.tables.syscall_counts = Box::new(FailingTable {
        name: "syscall_counts",
        fail_on,
    });
    probes
}
