//! allocwatch library - harvests allocation, slab cache and syscall
//! statistics of one process from the tables of an attached BPF probe object.
//!
//! The reducers ([`outstanding`], [`combined`], [`kernel_cache`], [`syscalls`])
//! work on any [`table::ProbeTable`], either the BPF maps of a loaded
//! [`probes::BpfProbes`] or the in-memory [`table::MemTable`]. The
//! [`harvest::Harvester`] drives them on an interval for as long as the
//! [`target::Target`] lives.
//!
//! # Example
//!
//! ```no_run
//! use allocwatch::{BlazeSymbolizer, HarvestConfig, Harvester, ProbeOptions, StopFlag, Target};
//! use allocwatch::probes::BpfProbes;
//!
//! let pid = 1234;
//! let probes = BpfProbes::load(&ProbeOptions {
//!     target_pid: pid,
//!     with_memory: true,
//!     ..Default::default()
//! })
//! .expect("Failed to load probes");
//!
//! let config = HarvestConfig {
//!     with_memory: true,
//!     snapshot_dir: Some("./snapshots".into()),
//!     ..Default::default()
//! };
//! let mut target = Target::from_parts(Some(pid), None, StopFlag::new()).unwrap();
//! let mut harvester = Harvester::new(config, probes, Box::new(BlazeSymbolizer::new()));
//! let summary = harvester.run(&mut target, None).expect("harvest failed");
//! println!("wrote {} snapshots", summary.snapshots.len());
//! ```

pub mod bpf_maps;
pub mod combined;
pub mod error;
pub mod harvest;
pub mod kernel_cache;
pub mod outstanding;
pub mod probes;
pub mod records;
pub mod snapshot;
pub mod symbolize;
pub mod syscalls;
pub mod table;
pub mod target;
pub mod traced_command;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use error::{HarvestError, Result};
pub use harvest::{HarvestConfig, HarvestState, HarvestSummary, Harvester, StopReason};
pub use probes::ProbeOptions;
pub use snapshot::Snapshot;
pub use symbolize::{BlazeSymbolizer, FrameStyle, StackResolver, Symbolize};
pub use target::{Handshake, SignalHandshake, StopFlag, Target};
