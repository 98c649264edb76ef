//! Records read out of the probe tables.
//!
//! These are the decoded, layout-independent forms. The raw `#[repr(C)]`
//! structs the BPF side writes live in [`crate::bpf_maps`].

use std::ffi::CStr;
use std::fmt;

use crate::utils::tid_from_tgidpid;

/// Identifier of a captured call stack. Negative values mean the probe could
/// not capture the stack (`-EFAULT`, `-EEXIST` from `bpf_get_stackid`).
pub type StackId = i64;

/// Maximum length of a slab cache name as captured by the probe.
pub const CACHE_NAME_LEN: usize = 32;

/// A live allocation, keyed by its address in the `allocs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRecord {
    pub size: u64,
    pub timestamp_ns: u64,
    pub stack_id: StackId,
}

/// Cumulative per-stack alloc/free ledger row from `combined_allocs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombinedAlloc {
    pub alloc_size: u64,
    pub free_size: u64,
    pub number_of_allocs: u64,
    pub number_of_frees: u64,
}

impl CombinedAlloc {
    /// Bytes allocated from this stack that have not been freed. Negative when
    /// frees were attributed to a stack whose allocations predate the probes.
    pub fn net_bytes(&self) -> i64 {
        (self.alloc_size as i64).wrapping_sub(self.free_size as i64)
    }
}

/// Name of a kernel slab cache, kept in the fixed-width form the probe uses
/// as its key so that deletes address exactly the row that was read.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheName([u8; CACHE_NAME_LEN]);

impl CacheName {
    /// Build a key from a name, truncating to the probe's key width.
    pub fn new(name: &str) -> Self {
        let mut raw = [0u8; CACHE_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(CACHE_NAME_LEN - 1);
        raw[..len].copy_from_slice(&bytes[..len]);
        CacheName(raw)
    }

    pub fn from_raw(raw: [u8; CACHE_NAME_LEN]) -> Self {
        CacheName(raw)
    }

    pub fn as_raw(&self) -> &[u8; CACHE_NAME_LEN] {
        &self.0
    }

    pub fn name(&self) -> String {
        match CStr::from_bytes_until_nul(&self.0) {
            Ok(cstr) => cstr.to_string_lossy().to_string(),
            // The probe copies a fixed number of bytes, a name filling all of
            // them has no terminator.
            Err(_) => String::from_utf8_lossy(&self.0).to_string(),
        }
    }
}

impl fmt::Debug for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheName").field(&self.name()).finish()
    }
}

/// Counters for one slab cache in `kernel_cache_counts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounter {
    pub alloc_count: u64,
    pub alloc_size: u64,
    pub free_count: u64,
    pub free_size: u64,
}

impl CacheCounter {
    /// More bytes allocated from the cache than returned to it.
    pub fn has_pressure(&self) -> bool {
        self.alloc_size > self.free_size
    }

    /// Frees have caught up with allocations; the row carries no more
    /// information and can be purged.
    pub fn is_reconciled(&self) -> bool {
        self.free_count >= self.alloc_count
    }
}

/// Composite key of the windowed `syscall_counts` table.
///
/// Packed into a u64 as `(syscall_id << 32) | thread_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyscallKey {
    pub syscall_id: u32,
    pub thread_id: u32,
}

impl SyscallKey {
    pub const fn new(syscall_id: u32, thread_id: u32) -> Self {
        SyscallKey {
            syscall_id,
            thread_id,
        }
    }

    pub const fn pack(&self) -> u64 {
        ((self.syscall_id as u64) << 32) | self.thread_id as u64
    }

    pub const fn unpack(packed: u64) -> Self {
        SyscallKey {
            syscall_id: (packed >> 32) as u32,
            thread_id: (packed & 0xFFFF_FFFF) as u32,
        }
    }
}

/// Count and accumulated latency of one syscall on one thread since the last
/// harvest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallCounter {
    pub count: u64,
    pub total_ns: u64,
}

/// A single syscall event with the stack that issued it, from
/// `syscall_counts_stacks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallStackSample {
    pub pid_tgid: u64,
    pub syscall_id: u64,
    pub stack_id: StackId,
}

impl SyscallStackSample {
    pub fn thread_id(&self) -> u32 {
        tid_from_tgidpid(self.pid_tgid)
    }
}
