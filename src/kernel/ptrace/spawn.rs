//! Launching the root tracee.
//!
//! The child arranges to be traced, installs its stdio, closes inherited
//! descriptors on exec, applies kernel ceilings, enters its root and working
//! directory, drops identity and execs. Any failure before exec is written to
//! a close-on-exec status pipe as a length-prefixed message, so the parent can
//! tell "exec failed" apart from "the program ran and exited".

use crate::config::policy::{Entry, Limit};
use crate::config::types::{ptrace_error, Result, TraceError};
use crate::kernel::ptrace::wait::{self, WaitEvent};
use crate::utils::fd_closure::mark_inherited_fds_cloexec;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, chroot, execvpe, fork, setuid, ForkResult, Pid, Uid};
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

/// Options set on the root right after its exec stop; inherited by every
/// task it creates.
pub fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_EXITKILL
}

fn to_spawn_error(prefix: &str, err: impl std::fmt::Display) -> TraceError {
    TraceError::Spawn(format!("{prefix}: {err}"))
}

/// Kernel ceilings installed before exec
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ceilings {
    /// RLIMIT_CPU soft limit in seconds; hard is one more
    pub cpu_seconds: Option<u64>,
    /// RLIMIT_DATA; RLIMIT_AS gets twice this
    pub memory: Option<u64>,
}

impl Ceilings {
    pub fn for_limit(limit: &Limit) -> Self {
        let cpu_seconds = (limit.user_time != Duration::MAX).then(|| {
            let millis = limit.user_time.as_millis() as u64;
            millis.div_ceil(1000).max(1)
        });
        let memory = (limit.memory != u64::MAX).then_some(limit.memory);
        Self {
            cpu_seconds,
            memory,
        }
    }
}

fn apply_rlimit_value(
    name: &str,
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    // SAFETY: setrlimit reads a fully initialized rlimit struct.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        return Ok(());
    }

    Err(to_spawn_error(
        &format!("setrlimit {}={} (hard={})", name, soft, hard),
        std::io::Error::last_os_error(),
    ))
}

fn apply_ceilings(ceilings: &Ceilings) -> Result<()> {
    if let Some(secs) = ceilings.cpu_seconds {
        // soft → SIGXCPU, hard → SIGKILL
        apply_rlimit_value("RLIMIT_CPU", libc::RLIMIT_CPU, secs, secs.saturating_add(1))?;
    }
    if let Some(bytes) = ceilings.memory {
        let space = bytes.saturating_mul(2);
        apply_rlimit_value("RLIMIT_AS", libc::RLIMIT_AS, space, space)?;
        apply_rlimit_value("RLIMIT_DATA", libc::RLIMIT_DATA, bytes, bytes)?;
    }
    Ok(())
}

/// Kill the tracee if the tracer dies. Must be called in the child after fork.
fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| to_spawn_error("Failed to set parent death signal", e))
}

/// Everything the child needs, converted before fork
struct Prepared {
    path: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    cwd: CString,
    root: Option<CString>,
    stdio: [RawFd; 3],
    uid: Option<u32>,
    ceilings: Ceilings,
}

fn c_path(what: &str, path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| TraceError::Config(format!("{what} contains NUL byte")))
}

fn c_string(what: &str, s: String) -> Result<CString> {
    CString::new(s).map_err(|_| TraceError::Config(format!("{what} contains NUL byte")))
}

impl Prepared {
    fn new(entry: &Entry, limit: &Limit) -> Result<Self> {
        let argv = entry
            .argv
            .iter()
            .map(|a| c_string("argument", a.clone()))
            .collect::<Result<Vec<_>>>()?;
        let env = entry
            .env
            .iter()
            .map(|(k, v)| c_string("environment", format!("{k}={v}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            path: c_path("executable path", &entry.path)?,
            argv,
            env,
            cwd: c_path("working directory", &entry.cwd)?,
            root: entry.root.as_deref().map(|r| c_path("root", r)).transpose()?,
            stdio: entry.stdio,
            uid: entry.uid,
            ceilings: Ceilings::for_limit(limit),
        })
    }
}

fn install_stdio(stdio: &[RawFd; 3]) -> Result<()> {
    for (target, &fd) in stdio.iter().enumerate() {
        let target = target as RawFd;
        if fd == target {
            continue;
        }
        // SAFETY: dup2 on caller-provided descriptors; failure is reported via errno.
        let rc = unsafe { libc::dup2(fd, target) };
        Errno::result(rc).map_err(|e| to_spawn_error(&format!("dup2({fd}, {target})"), e))?;
    }
    Ok(())
}

fn exec_child(prepared: &Prepared) -> Result<Infallible> {
    setup_parent_death_signal()?;
    ptrace::traceme().map_err(|e| to_spawn_error("PTRACE_TRACEME", e))?;
    install_stdio(&prepared.stdio)?;
    mark_inherited_fds_cloexec().map_err(|e| to_spawn_error("fd closure", e))?;
    apply_ceilings(&prepared.ceilings)?;
    if let Some(root) = &prepared.root {
        chroot(root.as_c_str()).map_err(|e| to_spawn_error(&format!("chroot({root:?})"), e))?;
    }
    chdir(prepared.cwd.as_c_str())
        .map_err(|e| to_spawn_error(&format!("chdir({:?})", prepared.cwd), e))?;
    if let Some(uid) = prepared.uid {
        setuid(Uid::from_raw(uid)).map_err(|e| to_spawn_error(&format!("setuid({uid})"), e))?;
    }
    execvpe(&prepared.path, &prepared.argv, &prepared.env)
        .map_err(|e| to_spawn_error(&format!("execvpe({:?})", prepared.path), e))
}

fn write_all(fd: RawFd, mut data: &[u8]) {
    while !data.is_empty() {
        // SAFETY: the pointer and length describe the live `data` slice.
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        }
        if n <= 0 {
            return;
        }
        data = &data[n as usize..];
    }
}

fn encode_failure(message: &str) -> Vec<u8> {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
    out.extend_from_slice(bytes);
    out
}

fn decode_failure(buf: &[u8]) -> Option<String> {
    let len = u32::from_ne_bytes(buf.get(..4)?.try_into().ok()?) as usize;
    let body = buf.get(4..4 + len)?;
    Some(String::from_utf8_lossy(body).into_owned())
}

fn status_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: pipe2 writes two descriptors into a two-element array.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    Errno::result(rc).map_err(|e| to_spawn_error("pipe2", e))?;
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn read_failure(read_end: OwnedFd) -> Option<String> {
    let mut buf = Vec::new();
    File::from(read_end).read_to_end(&mut buf).ok()?;
    decode_failure(&buf)
}

/// Fork and exec the root tracee, returning once it sits in its exec stop
/// with tracing options applied.
pub fn spawn_tracee(entry: &Entry, limit: &Limit) -> Result<Pid> {
    let prepared = Prepared::new(entry, limit)?;
    let (read_end, write_end) = status_pipe()?;

    // SAFETY: all allocations the child needs were made above; the child
    // only execs or exits.
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let message = match exec_child(&prepared) {
                Err(e) => e.to_string(),
                Ok(never) => match never {},
            };
            write_all(write_end.as_raw_fd(), &encode_failure(&message));
            // SAFETY: _exit skips atexit handlers and stdio flushing that
            // belong to the parent's copy of the process.
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(to_spawn_error("fork", e)),
    };
    drop(write_end);

    let report = wait::wait_for(child)?;
    match report.event() {
        Some(WaitEvent::SignalStop(libc::SIGTRAP)) => {}
        Some(WaitEvent::Exited(_)) | Some(WaitEvent::Signaled(_)) => {
            let message = read_failure(read_end)
                .unwrap_or_else(|| "tracee exited before exec".to_string());
            return Err(TraceError::Spawn(message));
        }
        other => {
            discard(child);
            return Err(TraceError::Spawn(format!(
                "unexpected first stop of {child}: {other:?}"
            )));
        }
    }

    if let Err(e) = ptrace::setoptions(child, trace_options()) {
        discard(child);
        return Err(ptrace_error("PTRACE_SETOPTIONS", child, e));
    }

    log::debug!("Tracee {} stopped at exec of {:?}", child, entry.path);
    Ok(child)
}

fn discard(child: Pid) {
    if let Err(e) = kill(child, Signal::SIGKILL) {
        log::debug!("Failed to kill half-spawned {}: {}", child, e);
    }
    if let Err(e) = wait::wait_for(child) {
        log::debug!("Failed to reap half-spawned {}: {}", child, e);
    }
}
