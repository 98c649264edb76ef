//! End-to-end runs of the harvest loop against in-memory tables.

mod common;

use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use allocwatch::probes::BpfProbes;
use allocwatch::table::ProbeSession;
use allocwatch::traced_command::spawn_traced_child;
use allocwatch::{
    HarvestConfig, HarvestError, HarvestState, Harvester, ProbeOptions, StopFlag, StopReason,
    Target,
};
use common::{
    empty_probes, failing_probes, populated_probes, populated_probes_with_syscall_stacks, FailOn,
    Notification, RecordingHandshake, StaticSymbolizer, THREAD_ID,
};
use serde_json::Value;
use tempfile::TempDir;

fn fast_config(dir: Option<PathBuf>) -> HarvestConfig {
    HarvestConfig {
        interval: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
        min_age_ns: 0,
        with_memory: true,
        snapshot_dir: dir,
        snapshot_prefix: "run".to_string(),
        handshake: true,
        ..Default::default()
    }
}

fn read_json(path: &PathBuf) -> Value {
    let text = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&text).unwrap()
}

/// A short-lived process that something other than the harvester reaps.
fn short_lived_pid(seconds: &str) -> (u32, thread::JoinHandle<()>) {
    let mut child = Command::new("sleep").arg(seconds).spawn().unwrap();
    let pid = child.id();
    let reaper = thread::spawn(move || {
        child.wait().unwrap();
    });
    (pid, reaper)
}

#[test]
fn test_loop_runs_until_target_exits() {
    let dir = TempDir::new().unwrap();
    let (pid, reaper) = short_lived_pid("0.3");
    let handshake = RecordingHandshake::default();

    let mut target = Target::from_parts(Some(pid), None, StopFlag::new()).unwrap();
    let mut harvester = Harvester::new(
        fast_config(Some(dir.path().to_path_buf())),
        populated_probes(),
        Box::new(StaticSymbolizer),
    )
    .with_handshake(Box::new(handshake.clone()));

    let summary = harvester.run(&mut target, None).unwrap();
    reaper.join().unwrap();

    assert_eq!(summary.reason, StopReason::TargetTerminated);
    assert!(summary.cycles >= 2, "only {} cycles", summary.cycles);
    assert_eq!(summary.snapshots.len(), summary.cycles);
    assert_eq!(harvester.state(), HarvestState::Stopped);
    assert_eq!(harvester.probes().detach_count, 1);
    assert_eq!(
        handshake.notifications(),
        vec![Notification::Ready(pid), Notification::Complete(pid)]
    );

    assert_eq!(summary.snapshots[0], dir.path().join("run.json"));
    assert_eq!(summary.snapshots[1], dir.path().join("run_1.json"));
    for path in &summary.snapshots {
        assert!(path.exists());
    }
}

#[test]
fn test_snapshot_contents() {
    let dir = TempDir::new().unwrap();
    let (pid, reaper) = short_lived_pid("0.25");

    let mut target = Target::from_parts(Some(pid), None, StopFlag::new()).unwrap();
    let mut harvester = Harvester::new(
        fast_config(Some(dir.path().to_path_buf())),
        populated_probes(),
        Box::new(StaticSymbolizer),
    )
    .with_handshake(Box::new(RecordingHandshake::default()));
    let summary = harvester.run(&mut target, None).unwrap();
    reaper.join().unwrap();
    assert!(summary.snapshots.len() >= 2);

    let first = read_json(&summary.snapshots[0]);
    assert!(first["time"].as_u64().unwrap() > 0);

    let memory = &first["memory_stats"];
    assert_eq!(memory["memory"], 832);
    assert_eq!(memory["stack_traces"], 2);
    let ledger = memory["combined_allocs"].as_array().unwrap();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0]["alloc_size"], 1024);
    assert_eq!(ledger[0]["trace"][0], "frame_100+0x0");

    // The allocation with a lost stack id is left out.
    let outstanding = memory["outstanding"].as_array().unwrap();
    assert_eq!(outstanding.len(), 2);
    assert_eq!(outstanding[0]["size"], 256);
    assert_eq!(outstanding[0]["count"], 1);
    assert_eq!(
        outstanding[0]["stack"][0],
        "0x0000000000000100 app!frame_100+0x0"
    );

    let caches = first["kernel_caches"].as_array().unwrap();
    assert_eq!(caches.len(), 1);
    assert_eq!(caches[0]["name"], "kmalloc-64");

    let thread = first["syscalls"]["11"].as_array().unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0]["name"], "read");
    assert_eq!(thread[0]["count"], 3);
    assert_eq!(thread[1]["name"], "write");
    assert!(first.get("syscall_details").is_none());

    // The syscall window was drained, the pressured cache is still reported.
    let second = read_json(&summary.snapshots[1]);
    assert_eq!(second["syscalls"], serde_json::json!({}));
    assert_eq!(second["kernel_caches"][0]["name"], "kmalloc-64");
    assert_eq!(second["memory_stats"]["memory"], 832);
}

#[test]
fn test_syscall_stacks_are_reported_by_frames() {
    let dir = TempDir::new().unwrap();
    let (pid, reaper) = short_lived_pid("0.25");

    let config = HarvestConfig {
        with_syscall_stacks: true,
        ..fast_config(Some(dir.path().to_path_buf()))
    };
    let mut target = Target::from_parts(Some(pid), None, StopFlag::new()).unwrap();
    let mut harvester = Harvester::new(
        config,
        populated_probes_with_syscall_stacks(),
        Box::new(StaticSymbolizer),
    )
    .with_handshake(Box::new(RecordingHandshake::default()));
    let summary = harvester.run(&mut target, None).unwrap();
    reaper.join().unwrap();
    assert!(summary.snapshots.len() >= 2);

    let tid = THREAD_ID.to_string();
    let first = read_json(&summary.snapshots[0]);
    let reads = first["syscall_details"][&tid]["read"].as_array().unwrap();
    // stack ids 3 and 4 hold the same frames
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0]["count"], 2);
    assert_eq!(reads[0]["stack_trace"], serde_json::json!(["frame_500+0x0"]));

    // The sample table is never cleared, the histogram keeps counting the run.
    let second = read_json(&summary.snapshots[1]);
    assert_eq!(second["syscall_details"][&tid]["read"][0]["count"], 2);
}

#[test]
fn test_syscall_stacks_without_sample_table() {
    let config = HarvestConfig {
        with_syscall_stacks: true,
        ..fast_config(None)
    };
    let mut harvester = Harvester::new(config, populated_probes(), Box::new(StaticSymbolizer));

    let snapshot = harvester.harvest_cycle(std::process::id()).unwrap().snapshot;
    assert!(snapshot.syscall_details.is_none());
    assert_eq!(snapshot.syscalls[&THREAD_ID].len(), 2);
}

fn assert_table_failure_stops(fail_on: FailOn) {
    let mut target = Target::from_parts(Some(std::process::id()), None, StopFlag::new()).unwrap();
    let handshake = RecordingHandshake::default();
    let config = HarvestConfig {
        interval: Duration::from_millis(20),
        ..fast_config(None)
    };
    let mut harvester = Harvester::new(config, failing_probes(fail_on), Box::new(StaticSymbolizer))
        .with_handshake(Box::new(handshake.clone()));

    let err = harvester.run(&mut target, None).unwrap_err();
    assert!(
        matches!(
            err,
            HarvestError::TableAccess {
                table: "syscall_counts",
                ..
            }
        ),
        "unexpected error {err:?}"
    );
    assert_eq!(harvester.state(), HarvestState::Stopped);
    assert_eq!(harvester.probes().detach_count, 1);
    assert_eq!(handshake.notifications().len(), 2);

}

#[test]
fn test_unreadable_table_stops_the_loop() {
    assert_table_failure_stops(FailOn::Entries);
}

#[test]
fn test_uncleared_table_stops_the_loop() {
    assert_table_failure_stops(FailOn::Clear);
}

#[test]
fn test_cancel_stops_without_a_cycle() {
    let mut target = Target::from_parts(Some(std::process::id()), None, StopFlag::new()).unwrap();
    let handshake = RecordingHandshake::default();
    let config = HarvestConfig {
        interval: Duration::from_secs(60),
        ..fast_config(None)
    };
    let mut harvester = Harvester::new(config, empty_probes(), Box::new(StaticSymbolizer))
        .with_handshake(Box::new(handshake.clone()));

    let (tx, rx) = channel();
    tx.send(()).unwrap();
    let summary = harvester.run(&mut target, Some(&rx)).unwrap();

    assert_eq!(summary.reason, StopReason::Cancelled);
    assert_eq!(summary.cycles, 0);
    assert_eq!(harvester.probes().detach_count, 1);
    assert_eq!(handshake.notifications().len(), 2);
}

#[test]
fn test_stop_flag_ends_the_loop() {
    let stop = StopFlag::new();
    let mut target = Target::from_parts(Some(std::process::id()), None, stop.clone()).unwrap();
    let mut harvester =
        Harvester::new(fast_config(None), empty_probes(), Box::new(StaticSymbolizer))
            .with_handshake(Box::new(RecordingHandshake::default()));

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        stop.request();
    });
    let summary = harvester.run(&mut target, None).unwrap();
    stopper.join().unwrap();

    assert_eq!(summary.reason, StopReason::TargetTerminated);
    assert!(summary.cycles >= 1);
    assert!(summary.snapshots.is_empty());
}

#[test]
fn test_dead_target_never_starts() {
    let (pid, reaper) = short_lived_pid("0");
    reaper.join().unwrap();

    let handshake = RecordingHandshake::default();
    let config = HarvestConfig {
        startup_timeout: Duration::from_millis(50),
        ..fast_config(None)
    };
    let mut target = Target::from_parts(Some(pid), None, StopFlag::new()).unwrap();
    let mut harvester = Harvester::new(config, empty_probes(), Box::new(StaticSymbolizer))
        .with_handshake(Box::new(handshake.clone()));

    let err = harvester.run(&mut target, None).unwrap_err();
    assert!(matches!(err, HarvestError::TargetNotAlive { .. }));
    assert_eq!(harvester.probes().detach_count, 1);
    assert!(handshake.notifications().is_empty());
}

#[test]
fn test_launched_command_exit_code() {
    let command: Vec<String> = ["sh", "-c", "sleep 0.2; exit 3"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut child = spawn_traced_child(&command).unwrap();
    child.signal_exec().unwrap();
    child.wait_for_exec().unwrap();
    let pid = child.pid();

    let mut target = Target::from_parts(None, Some(child), StopFlag::new()).unwrap();
    assert_eq!(target.pid(), pid);
    let mut harvester =
        Harvester::new(fast_config(None), empty_probes(), Box::new(StaticSymbolizer))
            .with_handshake(Box::new(RecordingHandshake::default()));

    let summary = harvester.run(&mut target, None).unwrap();
    assert_eq!(summary.reason, StopReason::TargetTerminated);
    assert!(summary.cycles >= 1);

    let mut child = target.into_child().unwrap();
    assert_eq!(child.wait().unwrap(), 3);
}

#[test]
#[ignore = "requires root and a built probe object in ALLOCWATCH_BPF_OBJECT"]
fn test_bpf_probes_attach_and_harvest() {
    let object_path = std::env::var("ALLOCWATCH_BPF_OBJECT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("allocwatch.bpf.o"));
    let (pid, reaper) = short_lived_pid("1");

    let mut probes = BpfProbes::load(&ProbeOptions {
        object_path,
        target_pid: pid,
        with_memory: true,
        ..Default::default()
    })
    .unwrap();
    assert!(probes.tables().allocs.is_some());

    let mut target = Target::from_parts(Some(pid), None, StopFlag::new()).unwrap();
    let config = HarvestConfig {
        handshake: false,
        ..fast_config(None)
    };
    let symbolizer = Box::new(allocwatch::BlazeSymbolizer::new());
    let mut harvester = Harvester::new(config, probes, symbolizer);
    let summary = harvester.run(&mut target, None).unwrap();
    reaper.join().unwrap();
    assert!(summary.cycles >= 1);
}
