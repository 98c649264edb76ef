//! The process being profiled: identification, liveness and signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::{HarvestError, Result};
use crate::traced_command::TracedChild;

/// Set from the SIGUSR2 handler.
static STOP_SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_: libc::c_int) {
    STOP_SIGNALLED.store(true, Ordering::SeqCst);
}

/// Out-of-band request to stop harvesting once the current cycle is done.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    requested: Arc<AtomicBool>,
    from_signal: bool,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is also raised when this process receives SIGUSR2.
    pub fn on_sigusr2() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_stop_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(Signal::SIGUSR2, &action) }.map_err(|source| HarvestError::Signal {
            pid: std::process::id(),
            source,
        })?;
        Ok(StopFlag {
            requested: Arc::new(AtomicBool::new(false)),
            from_signal: true,
        })
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
            || (self.from_signal && STOP_SIGNALLED.load(Ordering::SeqCst))
    }
}

/// Tells the target when tracing starts and ends.
pub trait Handshake {
    /// Probes are attached.
    fn ready(&mut self, pid: u32) -> Result<()>;
    /// Tracing has ended.
    fn complete(&mut self, pid: u32) -> Result<()>;
}

/// Sends SIGUSR1 for both notifications.
#[derive(Debug, Default)]
pub struct SignalHandshake;

impl SignalHandshake {
    fn notify(pid: u32) -> Result<()> {
        kill(Pid::from_raw(pid as i32), Signal::SIGUSR1)
            .map_err(|source| HarvestError::Signal { pid, source })
    }
}

impl Handshake for SignalHandshake {
    fn ready(&mut self, pid: u32) -> Result<()> {
        Self::notify(pid)
    }

    fn complete(&mut self, pid: u32) -> Result<()> {
        Self::notify(pid)
    }
}

/// The process being profiled, either a bare pid or a child we launched.
pub struct Target {
    pid: u32,
    child: Option<TracedChild>,
    stop: StopFlag,
}

impl Target {
    /// Exactly one of `pid` and `child` must be given.
    pub fn from_parts(
        pid: Option<u32>,
        child: Option<TracedChild>,
        stop: StopFlag,
    ) -> Result<Self> {
        match (pid, child) {
            (Some(_), Some(_)) => Err(HarvestError::Configuration(
                "a pid and a launched process are mutually exclusive".into(),
            )),
            (None, None) => Err(HarvestError::Configuration(
                "either a pid or a launched process must be given".into(),
            )),
            (Some(0), None) => Err(HarvestError::Configuration("pid 0 cannot be traced".into())),
            (Some(pid), None) => Ok(Target {
                pid,
                child: None,
                stop,
            }),
            (None, Some(child)) => Ok(Target {
                pid: child.pid(),
                child: Some(child),
                stop,
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn into_child(self) -> Option<TracedChild> {
        self.child
    }

    /// A bare pid is probed with a null signal; only `ESRCH` means it is gone.
    /// A launched child is checked with a non-blocking wait.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.is_alive(),
            None => !matches!(kill(Pid::from_raw(self.pid as i32), None), Err(Errno::ESRCH)),
        }
    }

    /// Exit code of a launched child that has exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.child.as_mut().and_then(|child| child.try_wait())
    }

    /// Whether the target is gone or has asked us to stop.
    pub fn is_terminated(&mut self) -> bool {
        if self.stop.is_requested() {
            debug!("stop requested for pid {}", self.pid);
            return true;
        }
        !self.is_alive()
    }

    /// Deliver a handshake notification, tolerating a target that already
    /// exited.
    pub(crate) fn tolerate_exit(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(HarvestError::Signal {
                source: Errno::ESRCH,
                ..
            }) => {
                warn!("pid {} exited before it could be notified", self.pid);
                Ok(())
            }
            other => other,
        }
    }
}
