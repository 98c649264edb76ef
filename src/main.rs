use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use log::{info, warn, LevelFilter};

use allocwatch::probes::BpfProbes;
use allocwatch::traced_command::{spawn_traced_child, TracedChild};
use allocwatch::{
    BlazeSymbolizer, HarvestConfig, HarvestError, Harvester, ProbeOptions, StopFlag, Target,
};

/// Live allocation, slab cache and syscall profiler for a single process.
#[derive(Debug, Parser)]
#[command(name = "allocwatch", version)]
struct Command {
    /// Pid of the process to profile.
    #[arg(short, long)]
    pid: Option<u32>,
    /// Seconds between two reports.
    #[arg(default_value = "5")]
    interval: u64,
    /// Command to launch and profile, given after `--`.
    #[arg(value_name = "COMMAND", last = true)]
    command: Vec<String>,
    /// Hide outstanding allocations younger than this many milliseconds.
    #[arg(short, long, default_value = "500")]
    older: u64,
    /// Record only every n-th allocation.
    #[arg(short = 's', long, default_value = "1")]
    alloc_sample_rate: u32,
    /// Entries in each top list.
    #[arg(short = 'T', long, default_value = "10")]
    top: usize,
    #[arg(short = 'z', long)]
    min_alloc_size: Option<u64>,
    #[arg(short = 'Z', long)]
    max_alloc_size: Option<u64>,
    /// Write JSON snapshots into DIR instead of printing reports.
    #[arg(
        short = 'S',
        long,
        value_name = "DIR",
        num_args = 0..=1,
        default_missing_value = "./snapshots"
    )]
    snapshots: Option<PathBuf>,
    /// File name prefix of the snapshots.
    #[arg(long, default_value = "snapshot")]
    prefix: String,
    /// Trace heap allocations and kernel slab caches.
    #[arg(long)]
    memory: bool,
    /// Collect a stack for every syscall.
    #[arg(long)]
    syscall_stacks: bool,
    /// SIGUSR1 the target when tracing starts and ends, stop on SIGUSR2.
    #[arg(long)]
    signals: bool,
    /// Prebuilt probe object.
    #[arg(long, default_value = "allocwatch.bpf.o")]
    bpf_object: PathBuf,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Command {
    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn probe_options(&self, target_pid: u32) -> ProbeOptions {
        ProbeOptions {
            object_path: self.bpf_object.clone(),
            target_pid,
            sample_every_n: self.alloc_sample_rate,
            min_alloc_size: self.min_alloc_size,
            max_alloc_size: self.max_alloc_size,
            with_memory: self.memory,
            with_syscall_stacks: self.syscall_stacks,
        }
    }

    fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig {
            top: self.top,
            interval: Duration::from_secs(self.interval),
            min_age_ns: self.older.saturating_mul(1_000_000),
            with_memory: self.memory,
            with_syscall_stacks: self.syscall_stacks,
            snapshot_dir: self.snapshots.clone(),
            snapshot_prefix: self.prefix.clone(),
            handshake: self.signals,
            ..Default::default()
        }
    }
}

fn init_logging(opts: &Command) {
    env_logger::Builder::new()
        .filter_level(opts.log_level())
        .parse_default_env()
        .init();
}

/// The pid to trace, and the child we launched for it if any.
fn launch(opts: &Command) -> Result<(u32, Option<TracedChild>)> {
    match (opts.pid, opts.command.is_empty()) {
        (Some(_), false) => Err(HarvestError::Configuration(
            "--pid and a command are mutually exclusive".into(),
        )
        .into()),
        (None, true) => Err(HarvestError::Configuration(
            "either --pid or a command after -- must be given".into(),
        )
        .into()),
        (Some(pid), true) => Ok((pid, None)),
        (None, false) => {
            let child = spawn_traced_child(&opts.command)?;
            Ok((child.pid(), Some(child)))
        }
    }
}

fn run(opts: Command) -> Result<i32> {
    if opts.interval == 0 {
        bail!(HarvestError::Configuration("interval must be at least 1 second".into()));
    }

    // Fork before any thread exists.
    let (pid, mut child) = launch(&opts)?;

    let stop = if opts.signals {
        StopFlag::on_sigusr2()?
    } else {
        StopFlag::new()
    };

    let probes = BpfProbes::load(&opts.probe_options(pid))
        .with_context(|| format!("Failed to attach probes to pid {pid}"))?;

    if let Some(child) = child.as_mut() {
        child.signal_exec()?;
        child.wait_for_exec()?;
    }

    let mut target = Target::from_parts(
        if child.is_some() { None } else { Some(pid) },
        child,
        stop,
    )?;

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    eprintln!("Tracing PID {pid}");
    eprintln!("Press Ctrl-C to stop");

    let mut harvester = Harvester::new(
        opts.harvest_config(),
        probes,
        Box::new(BlazeSymbolizer::new()),
    );
    let summary = harvester.run(&mut target, Some(&stop_rx))?;
    drop(harvester);
    info!(
        "{} cycles, {} snapshots written",
        summary.cycles,
        summary.snapshots.len()
    );

    match target.into_child() {
        Some(mut child) => {
            let code = child.wait()?;
            if code != 0 {
                warn!("pid {pid} exited with status {code}");
            }
            Ok(code)
        }
        None => Ok(0),
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(&opts);

    let code = run(opts)?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Command::try_parse_from(["allocwatch", "-p", "42"]).unwrap();
        assert_eq!(opts.pid, Some(42));
        assert_eq!(opts.interval, 5);
        assert_eq!(opts.top, 10);
        assert!(opts.snapshots.is_none());
        assert_eq!(opts.log_level(), LevelFilter::Warn);

        let config = opts.harvest_config();
        assert_eq!(config.min_age_ns, 500_000_000);
        assert!(!config.handshake);
    }

    #[test]
    fn test_snapshot_flag_without_dir() {
        let opts = Command::try_parse_from(["allocwatch", "-p", "42", "-S", "-vv"]).unwrap();
        assert_eq!(opts.snapshots, Some(PathBuf::from("./snapshots")));
        assert_eq!(opts.log_level(), LevelFilter::Debug);

        let opts =
            Command::try_parse_from(["allocwatch", "-p", "42", "-S", "/tmp/out", "2"]).unwrap();
        assert_eq!(opts.snapshots, Some(PathBuf::from("/tmp/out")));
        assert_eq!(opts.interval, 2);
    }

    #[test]
    fn test_trailing_command() {
        let opts =
            Command::try_parse_from(["allocwatch", "--memory", "--", "sleep", "-x", "1"]).unwrap();
        assert_eq!(opts.command, vec!["sleep", "-x", "1"]);
        assert!(opts.probe_options(7).with_memory);
    }

    #[test]
    fn test_target_is_required() {
        let opts = Command::try_parse_from(["allocwatch"]).unwrap();
        let err = launch(&opts).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::Configuration(_))
        ));
    }
}
