//! Launching the command to profile.
//!
//! [`spawn_traced_child`] forks a child that blocks on a pipe until
//! [`TracedChild::signal_exec`] is called, so the probes can be attached to the
//! child's pid before the command runs a single instruction. The child
//! inherits our stdio.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Exit code reported when the child's status could not be collected.
const UNKNOWN_EXIT: i32 = 1;

/// A forked child waiting to exec the traced command.
///
/// An un-reaped child is killed with `SIGKILL` and reaped on drop.
pub struct TracedChild {
    pid: u32,
    /// Writing a byte here lets the child exec.
    ready: Option<OwnedFd>,
    /// `O_CLOEXEC` pipe: EOF once exec succeeded, an errno if it failed.
    exec_status: Option<OwnedFd>,
    exit_code: Option<i32>,
}

impl Drop for TracedChild {
    fn drop(&mut self) {
        self.ready.take();
        self.exec_status.take();
        if self.exit_code.is_none() {
            let pid = Pid::from_raw(self.pid as i32);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}

fn exit_code_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

impl TracedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Let the child exec the command.
    pub fn signal_exec(&mut self) -> Result<()> {
        if let Some(fd) = self.ready.take() {
            File::from(fd)
                .write_all(&[1])
                .context("Failed to signal child to exec")?;
        }
        Ok(())
    }

    /// Block until the child has exec'd, failing if exec did.
    pub fn wait_for_exec(&mut self) -> Result<()> {
        let Some(fd) = self.exec_status.take() else {
            return Ok(());
        };
        let mut buf = [0u8; 4];
        let n = File::from(fd)
            .read(&mut buf)
            .context("Failed to read exec status pipe")?;
        if n > 0 {
            let errno = if n == 4 {
                i32::from_ne_bytes(buf)
            } else {
                buf[0] as i32
            };
            self.wait()?;
            bail!(
                "Failed to exec command: {}",
                std::io::Error::from_raw_os_error(errno)
            );
        }
        Ok(())
    }

    /// Exit code of the child if it has exited, without blocking.
    ///
    /// A child killed by a signal reports `128 + signo`, as shells do.
    pub fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match waitpid(Pid::from_raw(self.pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => self.exit_code = exit_code_of(status),
            Err(Errno::EINTR) => {}
            Err(e) => {
                debug!("waitpid({}) failed: {e}", self.pid);
                self.exit_code = Some(UNKNOWN_EXIT);
            }
        }
        self.exit_code
    }

    pub fn is_alive(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Block until the child exits and return its exit code.
    pub fn wait(&mut self) -> Result<i32> {
        // Closing the ready pipe without writing makes a child that never got
        // to exec give up.
        self.ready.take();
        while self.exit_code.is_none() {
            match waitpid(Pid::from_raw(self.pid as i32), None) {
                Ok(status) => self.exit_code = exit_code_of(status),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => self.exit_code = Some(UNKNOWN_EXIT),
                Err(e) => return Err(e).with_context(|| format!("waitpid({})", self.pid)),
            }
        }
        Ok(self.exit_code.unwrap_or(UNKNOWN_EXIT))
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve a command name to a path, searching `PATH` when it has no slash.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        if !is_executable(path) {
            bail!("'{}' does not exist or is not an executable file", name);
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    bail!(
        "Command '{}' not found in PATH. Specify the full path to the executable.",
        name
    );
}

fn pipe(flags: libc::c_int) -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create pipe");
    }
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Fork a child that will exec `command` once signalled.
///
/// Must be called before any other threads are started: the child only uses
/// async-signal-safe calls and always ends in `execv` or `_exit`.
pub fn spawn_traced_child(command: &[String]) -> Result<TracedChild> {
    let Some(program) = command.first() else {
        bail!("No command specified to run");
    };

    let resolved = resolve_executable(program).context("Failed to resolve command")?;
    debug!("resolved command {} -> {}", program, resolved.display());

    // Everything the child needs is allocated before fork.
    let path = CString::new(resolved.as_os_str().as_bytes())
        .context("Command path contains null byte")?;
    let args = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument contains null byte: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // Both pipes are close-on-exec so children forked concurrently by other
    // threads can't hold our ends open.
    let (ready_read, ready_write) = pipe(libc::O_CLOEXEC)?;
    let (exec_read, exec_write) = pipe(libc::O_CLOEXEC)?;
    let parent = unsafe { libc::getpid() };

    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).context("fork() failed"),
        0 => {
            use std::os::fd::AsRawFd;

            let ready_read = ready_read.as_raw_fd();
            let exec_write = exec_write.as_raw_fd();
            unsafe {
                libc::close(ready_write.as_raw_fd());
                libc::close(exec_read.as_raw_fd());

                // Don't outlive a profiler that dies before letting us run.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                if libc::getppid() != parent {
                    libc::_exit(1);
                }

                let mut buf = [0u8; 1];
                let n = libc::read(ready_read, buf.as_mut_ptr() as *mut libc::c_void, 1);
                if n <= 0 {
                    libc::_exit(1);
                }
                libc::close(ready_read);

                libc::execv(path.as_ptr(), argv.as_ptr());

                let errno = (*libc::__errno_location()).to_ne_bytes();
                libc::write(exec_write, errno.as_ptr() as *const libc::c_void, errno.len());
                libc::_exit(127);
            }
        }
        child => {
            drop(ready_read);
            drop(exec_write);
            Ok(TracedChild {
                pid: child as u32,
                ready: Some(ready_write),
                exec_status: Some(exec_read),
                exit_code: None,
            })
        }
    }
}
