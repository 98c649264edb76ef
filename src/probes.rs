//! Loading and attaching the prebuilt probe object.
//!
//! The object is configured through a `probe_config` block at the start of its
//! `.rodata` section, which has to be written between open and load.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use libbpf_rs::{
    Link, MapCore, MapHandle, Object, ObjectBuilder, TracepointCategory, TracepointOpts,
    UprobeOpts,
};
use log::{debug, info, warn};
use plain::Plain;

use crate::bpf_maps::{BpfStackTraces, BpfTable};
use crate::error::HarvestError;
use crate::table::{ProbeSession, ProbeTables};

const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;
const LIBC: &str = "libc.so.6";

/// Allocators that get an entry and a return probe.
const ALLOC_FUNCS: &[&str] = &[
    "malloc",
    "calloc",
    "realloc",
    "mmap",
    "posix_memalign",
    "valloc",
    "memalign",
    "pvalloc",
    "aligned_alloc",
];
const FREE_FUNCS: &[&str] = &["free", "munmap"];
const CACHE_ALLOC_FUNCS: &[&str] = &[
    "kmem_cache_alloc_lru",
    "kmem_cache_alloc_bulk",
    "kmem_cache_alloc_node",
];
const CACHE_FREE_FUNCS: &[&str] = &["kmem_cache_free", "kmem_cache_free_bulk"];

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub object_path: PathBuf,
    pub target_pid: u32,
    /// Only every n-th allocation is recorded.
    pub sample_every_n: u32,
    pub min_alloc_size: Option<u64>,
    pub max_alloc_size: Option<u64>,
    pub with_memory: bool,
    pub with_syscall_stacks: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            object_path: PathBuf::from("allocwatch.bpf.o"),
            target_pid: 0,
            sample_every_n: 1,
            min_alloc_size: None,
            max_alloc_size: None,
            with_memory: false,
            with_syscall_stacks: false,
        }
    }
}

impl ProbeOptions {
    pub fn validate(&self) -> Result<(), HarvestError> {
        if let (Some(min), Some(max)) = (self.min_alloc_size, self.max_alloc_size) {
            if min > max {
                return Err(HarvestError::Configuration(format!(
                    "min allocation size {min} is larger than max allocation size {max}"
                )));
            }
        }
        if self.sample_every_n == 0 {
            return Err(HarvestError::Configuration(
                "allocation sample rate must be at least 1".into(),
            ));
        }
        if self.target_pid == 0 {
            return Err(HarvestError::Configuration("no target pid to probe".into()));
        }
        Ok(())
    }

    fn probe_config(&self) -> probe_config {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        probe_config {
            target_tgid: self.target_pid,
            sample_every_n: self.sample_every_n,
            page_size: u64::try_from(page_size).unwrap_or(4096),
            min_alloc_size: self.min_alloc_size.unwrap_or(0),
            max_alloc_size: self.max_alloc_size.unwrap_or(u64::MAX),
            with_memory: self.with_memory as u8,
            with_syscall_stacks: self.with_syscall_stacks as u8,
            _pad: [0; 6],
        }
    }
}

/// Read-only configuration consumed by the probe programs.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct probe_config {
    pub target_tgid: u32,
    pub sample_every_n: u32,
    pub page_size: u64,
    pub min_alloc_size: u64,
    pub max_alloc_size: u64,
    pub with_memory: u8,
    pub with_syscall_stacks: u8,
    pub _pad: [u8; 6],
}

unsafe impl Plain for probe_config {}

/// Bump the memory lock rlimit for BPF programs.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB. This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }

    Ok(())
}

/// The loaded probe object, its links and the tables it fills.
pub struct BpfProbes {
    tables: ProbeTables,
    links: Vec<Link>,
    object: Option<Object>,
}

fn map_handle(object: &Object, name: &str) -> Result<MapHandle> {
    let map = object
        .maps()
        .find(|m| m.name() == name)
        .with_context(|| format!("Probe object has no map named '{name}'"))?;
    MapHandle::try_from(&map).with_context(|| format!("Failed to get handle to BPF map '{name}'"))
}

/// Which of `funcs` the running kernel has. Without kallsyms access all of
/// them are assumed present and the attach itself decides.
fn kernel_functions<'a>(funcs: impl Iterator<Item = &'a str>) -> HashSet<&'a str> {
    let Ok(kallsyms) = std::fs::read_to_string("/proc/kallsyms") else {
        return funcs.collect();
    };
    let present: HashSet<&str> = kallsyms
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .collect();
    funcs.filter(|f| present.contains(f)).collect()
}

impl BpfProbes {
    pub fn load(opts: &ProbeOptions) -> Result<Self> {
        opts.validate()?;
        bump_memlock_rlimit()?;

        let mut open_object = ObjectBuilder::default()
            .open_file(&opts.object_path)
            .with_context(|| format!("Failed to open {}", opts.object_path.display()))?;

        let config = opts.probe_config();
        let config_bytes = unsafe { plain::as_bytes(&config) };
        let mut configured = false;
        for mut map in open_object.maps_mut() {
            if !map.name().to_string_lossy().ends_with(".rodata") {
                continue;
            }
            if let Some(data) = map.initial_value_mut() {
                if data.len() < config_bytes.len() {
                    bail!(".rodata is smaller than probe_config");
                }
                data[..config_bytes.len()].copy_from_slice(config_bytes);
                configured = true;
            }
        }
        if !configured {
            bail!("Probe object has no .rodata section to configure");
        }

        let mut object = open_object.load().context("Failed to load probe object")?;
        let links = Self::attach(&mut object, opts)?;
        info!("attached {} probes to pid {}", links.len(), opts.target_pid);

        let tables = Self::open_tables(&object, opts)?;
        Ok(BpfProbes {
            tables,
            links,
            object: Some(object),
        })
    }

    fn attach(object: &mut Object, opts: &ProbeOptions) -> Result<Vec<Link>> {
        let mut links = Vec::new();
        let pid = opts.target_pid as i32;

        if opts.with_memory {
            let uprobes = ALLOC_FUNCS
                .iter()
                .flat_map(|f| [(*f, format!("{f}_enter"), false), (*f, format!("{f}_exit"), true)])
                .chain(FREE_FUNCS.iter().map(|f| (*f, format!("{f}_enter"), false)));
            for (func, prog_name, retprobe) in uprobes {
                let prog = object
                    .progs_mut()
                    .find(|p| p.name() == prog_name.as_str())
                    .with_context(|| format!("Probe object has no program '{prog_name}'"))?;
                let link = prog
                    .attach_uprobe_with_opts(
                        pid,
                        LIBC,
                        0,
                        UprobeOpts {
                            retprobe,
                            func_name: Some(func.to_string()),
                            ..Default::default()
                        },
                    )
                    .with_context(|| format!("Failed to attach {prog_name} to {LIBC}:{func}"))?;
                links.push(link);
            }

            let kprobes = CACHE_ALLOC_FUNCS
                .iter()
                .map(|f| ("trace_cache_alloc", *f))
                .chain(CACHE_FREE_FUNCS.iter().map(|f| ("trace_cache_free", *f)));
            let available =
                kernel_functions(CACHE_ALLOC_FUNCS.iter().chain(CACHE_FREE_FUNCS).copied());
            for (prog_name, func) in kprobes {
                if !available.contains(func) {
                    warn!("kernel has no {func}, not tracing it");
                    continue;
                }
                let prog = object
                    .progs_mut()
                    .find(|p| p.name() == prog_name)
                    .with_context(|| format!("Probe object has no program '{prog_name}'"))?;
                match prog.attach_kprobe(false, func) {
                    Ok(link) => links.push(link),
                    Err(e) => warn!("failed to attach kprobe {func}: {e}"),
                }
            }
        }

        for (prog_name, event) in [("sys_enter", "sys_enter"), ("sys_exit", "sys_exit")] {
            let prog = object
                .progs_mut()
                .find(|p| p.name() == prog_name)
                .with_context(|| format!("Probe object has no program '{prog_name}'"))?;
            let link = prog
                .attach_tracepoint_with_opts(
                    TracepointCategory::Custom("raw_syscalls".to_string()),
                    event,
                    TracepointOpts::default(),
                )
                .with_context(|| format!("Failed to attach tracepoint raw_syscalls:{event}"))?;
            links.push(link);
        }

        Ok(links)
    }

    fn open_tables(object: &Object, opts: &ProbeOptions) -> Result<ProbeTables> {
        let stack_traces = Box::new(BpfStackTraces::new(map_handle(object, "stack_traces")?));
        let syscall_counts = Box::new(BpfTable::new(
            "syscall_counts",
            map_handle(object, "syscall_counts")?,
        ));

        let mut tables = ProbeTables {
            stack_traces,
            allocs: None,
            combined_allocs: None,
            kernel_cache_counts: None,
            syscall_counts,
            syscall_counts_stacks: None,
        };
        if opts.with_memory {
            tables.allocs = Some(Box::new(BpfTable::new("allocs", map_handle(object, "allocs")?)));
            tables.combined_allocs = Some(Box::new(BpfTable::new(
                "combined_allocs",
                map_handle(object, "combined_allocs")?,
            )));
            tables.kernel_cache_counts = Some(Box::new(BpfTable::new(
                "kernel_cache_counts",
                map_handle(object, "kernel_cache_counts")?,
            )));
        }
        if opts.with_syscall_stacks {
            tables.syscall_counts_stacks = Some(Box::new(BpfTable::new(
                "syscall_counts_stacks",
                map_handle(object, "syscall_counts_stacks")?,
            )));
        }
        Ok(tables)
    }
}

impl ProbeSession for BpfProbes {
    fn tables(&mut self) -> &mut ProbeTables {
        &mut self.tables
    }

    fn detach(&mut self) {
        debug!("detaching {} probes", self.links.len());
        self.links.clear();
        self.object.take();
    }
}
