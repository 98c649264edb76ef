//! Utility functions for working with combined tgidpid values and clocks.
//!
//! In the Linux kernel, `bpf_get_current_pid_tgid()` returns a u64 where:
//! - Lower 32 bits: TID (Thread ID)
//! - Upper 32 bits: TGID (Thread Group ID, which is the Process ID)

use std::time::{SystemTime, UNIX_EPOCH};

use nix::time::{clock_gettime, ClockId};

/// Extract TID (Thread ID) from combined tgidpid value.
///
/// # Examples
///
/// ```
/// use allocwatch::utils::tid_from_tgidpid;
///
/// let tgidpid: u64 = 0x0000_1234_0000_5678;
/// assert_eq!(tid_from_tgidpid(tgidpid), 0x5678);
/// ```
#[inline(always)]
pub const fn tid_from_tgidpid(tgidpid: u64) -> u32 {
    (tgidpid & 0xFFFF_FFFF) as u32
}

/// Current CLOCK_MONOTONIC value in nanoseconds, the clock `bpf_ktime_get_ns()` uses.
pub fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Wall clock time in milliseconds since the epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
