//! The harvest loop.
//!
//! ```text
//! WaitingForTarget --target alive--> Running --target gone / cancel / error--> Stopped
//! ```
//!
//! While running, the loop sleeps for one interval in `poll_interval` steps,
//! checking the target between steps, then runs one cycle: read the memory
//! tables, reconcile the kernel caches, drain the syscall window, and emit the
//! resulting [`Snapshot`]. An operator cancel during the sleep ends the loop
//! without a final cycle. Probes are detached exactly once on every way out.

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::combined::{self, MemoryLedger};
use crate::error::{HarvestError, Result};
use crate::kernel_cache;
use crate::outstanding::{self, OutstandingReport};
use crate::snapshot::{ConsoleReport, MemoryStats, Snapshot, SnapshotWriter};
use crate::symbolize::{StackResolver, Symbolize};
use crate::syscalls;
use crate::table::{ProbeSession, ProbeTables};
use crate::target::{Handshake, SignalHandshake, Target};
use crate::utils::{epoch_millis, monotonic_ns};

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Entries kept in each top-K report.
    pub top: usize,
    /// Time between two cycles.
    pub interval: Duration,
    /// Granularity of liveness and cancel checks while sleeping.
    pub poll_interval: Duration,
    /// Outstanding allocations younger than this are left out.
    pub min_age_ns: u64,
    pub with_memory: bool,
    pub with_syscall_stacks: bool,
    /// Write JSON snapshots here instead of printing to stdout.
    pub snapshot_dir: Option<PathBuf>,
    pub snapshot_prefix: String,
    /// Notify the target when tracing starts and stops.
    pub handshake: bool,
    pub startup_timeout: Duration,
    pub startup_poll: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig {
            top: 10,
            interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            min_age_ns: 500_000_000,
            with_memory: false,
            with_syscall_stacks: false,
            snapshot_dir: None,
            snapshot_prefix: "snapshot".to_string(),
            handshake: false,
            startup_timeout: Duration::from_secs(5),
            startup_poll: Duration::from_millis(10),
        }
    }
}

impl HarvestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() || self.startup_poll.is_zero() {
            return Err(HarvestError::Configuration(
                "poll intervals must be non-zero".into(),
            ));
        }
        if self.snapshot_prefix.is_empty() || self.snapshot_prefix.contains('/') {
            return Err(HarvestError::Configuration(format!(
                "invalid snapshot prefix '{}'",
                self.snapshot_prefix
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    WaitingForTarget,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The target exited or asked us to stop.
    TargetTerminated,
    /// Operator interrupt while sleeping.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestSummary {
    pub cycles: usize,
    /// Files written, in order. Empty when reporting to the console.
    pub snapshots: Vec<PathBuf>,
    pub reason: StopReason,
}

enum Wake {
    Elapsed,
    Cancelled,
}

/// Everything one cycle produced.
pub struct CycleOutput {
    pub snapshot: Snapshot,
    /// Full outstanding view behind `snapshot.memory_stats.outstanding`.
    pub outstanding: Option<OutstandingReport>,
}

pub struct Harvester<P: ProbeSession> {
    config: HarvestConfig,
    probes: P,
    symbolizer: Box<dyn Symbolize>,
    handshake: Box<dyn Handshake>,
    writer: Option<SnapshotWriter>,
    state: HarvestState,
    detached: bool,
}

impl<P: ProbeSession> Harvester<P> {
    pub fn new(config: HarvestConfig, probes: P, symbolizer: Box<dyn Symbolize>) -> Self {
        let writer = config
            .snapshot_dir
            .as_ref()
            .map(|dir| SnapshotWriter::new(dir, config.snapshot_prefix.clone()));
        Harvester {
            config,
            probes,
            symbolizer,
            handshake: Box::new(SignalHandshake),
            writer,
            state: HarvestState::WaitingForTarget,
            detached: false,
        }
    }

    /// Replace the SIGUSR1 handshake.
    pub fn with_handshake(mut self, handshake: Box<dyn Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn state(&self) -> HarvestState {
        self.state
    }

    pub fn probes(&self) -> &P {
        &self.probes
    }

    /// Harvest `target` until it goes away, `cancel` fires, or a table can't
    /// be read.
    pub fn run(
        &mut self,
        target: &mut Target,
        cancel: Option<&Receiver<()>>,
    ) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary {
            cycles: 0,
            snapshots: Vec::new(),
            reason: StopReason::TargetTerminated,
        };
        let result = self.run_until_stopped(target, cancel, &mut summary);
        let notify = self.state == HarvestState::Running && self.config.handshake;
        self.state = HarvestState::Stopped;
        info!(
            "stopped after {} cycles ({:?}), detaching",
            summary.cycles, summary.reason
        );

        let completed = if notify {
            let sent = self.handshake.complete(target.pid());
            target.tolerate_exit(sent)
        } else {
            Ok(())
        };
        self.detach();

        result?;
        completed?;
        Ok(summary)
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.probes.detach();
        }
    }

    fn run_until_stopped(
        &mut self,
        target: &mut Target,
        mut cancel: Option<&Receiver<()>>,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        self.config.validate()?;
        self.wait_for_target(target)?;

        self.state = HarvestState::Running;
        info!("harvesting pid {} every {:?}", target.pid(), self.config.interval);
        if self.config.handshake {
            let sent = self.handshake.ready(target.pid());
            target.tolerate_exit(sent)?;
        }

        loop {
            if let Wake::Cancelled = self.sleep_interval(target, &mut cancel) {
                info!("cancelled by operator");
                summary.reason = StopReason::Cancelled;
                return Ok(());
            }

            let output = self.harvest_cycle(target.pid())?;
            summary.cycles += 1;
            if let Some(path) = self.emit(&output)? {
                summary.snapshots.push(path);
            }

            if target.is_terminated() {
                info!("pid {} terminated", target.pid());
                summary.reason = StopReason::TargetTerminated;
                return Ok(());
            }
        }
    }

    fn wait_for_target(&self, target: &mut Target) -> Result<()> {
        let started = Instant::now();
        while !target.is_alive() {
            if let Some(code) = target.exit_code() {
                return Err(HarvestError::TargetNotAlive {
                    pid: target.pid(),
                    reason: format!("exited with status {code}"),
                });
            }
            if started.elapsed() >= self.config.startup_timeout {
                return Err(HarvestError::TargetNotAlive {
                    pid: target.pid(),
                    reason: format!("not alive after {:?}", self.config.startup_timeout),
                });
            }
            thread::sleep(self.config.startup_poll);
        }
        Ok(())
    }

    /// Sleep one interval, returning early once the target is gone.
    fn sleep_interval(&self, target: &mut Target, cancel: &mut Option<&Receiver<()>>) -> Wake {
        let deadline = Instant::now() + self.config.interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wake::Elapsed;
            }
            let step = self.config.poll_interval.min(deadline - now);

            match cancel {
                Some(rx) => match rx.recv_timeout(step) {
                    Ok(()) => return Wake::Cancelled,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("cancel channel closed");
                        *cancel = None;
                        thread::sleep(step);
                    }
                },
                None => thread::sleep(step),
            }

            if target.is_terminated() {
                return Wake::Elapsed;
            }
        }
    }

    /// Read every table once and build a snapshot.
    ///
    /// Memory tables are read before the kernel caches are purged and the
    /// syscall window is cleared.
    pub fn harvest_cycle(&mut self, pid: u32) -> Result<CycleOutput> {
        let HarvestConfig {
            top,
            min_age_ns,
            with_memory,
            with_syscall_stacks,
            ..
        } = self.config;

        let ProbeTables {
            stack_traces,
            allocs,
            combined_allocs,
            kernel_cache_counts,
            syscall_counts,
            syscall_counts_stacks,
        } = self.probes.tables();
        let mut resolver = StackResolver::new(&**stack_traces, &mut *self.symbolizer, pid);

        let mut snapshot = Snapshot {
            time: epoch_millis(),
            ..Default::default()
        };
        let mut outstanding = None;

        if with_memory {
            let report = match allocs.as_deref() {
                Some(table) => {
                    outstanding::collect(table, &mut resolver, monotonic_ns(), min_age_ns)?
                }
                None => OutstandingReport::default(),
            };
            let ledger = match combined_allocs.as_deref() {
                Some(table) => combined::reduce(table, &mut resolver, top)?,
                None => MemoryLedger::default(),
            };
            snapshot.memory_stats = Some(MemoryStats {
                ledger,
                outstanding: report.top(top),
            });
            outstanding = Some(report);

            snapshot.kernel_caches = Some(match kernel_cache_counts.as_deref_mut() {
                Some(table) => kernel_cache::reduce(table, top)?,
                None => Vec::new(),
            });
        }

        snapshot.syscalls = syscalls::drain_counts(&mut **syscall_counts)?;

        if with_syscall_stacks {
            match syscall_counts_stacks.as_deref() {
                Some(table) => {
                    snapshot.syscall_details =
                        Some(syscalls::drain_stack_samples(table, &mut resolver)?)
                }
                None => warn!("syscall stacks requested but the probes don't collect them"),
            }
        }

        Ok(CycleOutput {
            snapshot,
            outstanding,
        })
    }

    fn emit(&self, output: &CycleOutput) -> Result<Option<PathBuf>> {
        match &self.writer {
            Some(writer) => writer.write(&output.snapshot).map(Some),
            None => {
                let report = ConsoleReport {
                    snapshot: &output.snapshot,
                    live: output.outstanding.as_ref(),
                    top: self.config.top,
                };
                report.render(&mut io::stdout().lock())?;
                Ok(None)
            }
        }
    }
}

impl<P: ProbeSession> Drop for Harvester<P> {
    fn drop(&mut self) {
        self.detach();
    }
}
