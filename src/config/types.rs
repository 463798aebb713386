/// Core types shared by the tracer, the checkers and whatever renders results
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Terminal status of a trace session - CLOSED TAXONOMY
///
/// Every session concludes with exactly one of these.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum TraceStatus {
    /// Process tree drained with no veto
    #[serde(rename = "OK")]
    Ok,
    /// CPU time ceiling hit (limit signal or sampled aggregate)
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// Memory ceiling hit
    #[serde(rename = "MEMOUT")]
    MemOut,
    /// Too many descriptors held
    #[serde(rename = "FDOUT")]
    FdOut,
    /// Process or thread count ceiling hit
    #[serde(rename = "TASKOUT")]
    TaskOut,
    /// Clone requested with untraced semantics
    #[serde(rename = "CLONE_DENY")]
    CloneDeny,
    /// Syscall outside the allow-set
    #[serde(rename = "CALL_DENY")]
    CallDeny,
    /// Path or open flags outside every access list
    #[serde(rename = "PATH_DENY")]
    PathDeny,
    /// Cumulative write volume exceeded
    #[serde(rename = "WRITE_OUT")]
    WriteOut,
    /// Cumulative read volume exceeded
    #[serde(rename = "READ_OUT")]
    ReadOut,
    /// Tracing or spawn primitive failed
    #[serde(rename = "TRACER_ERR")]
    TracerErr,
    /// Not yet decided
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl TraceStatus {
    pub fn is_violation(self) -> bool {
        !matches!(self, TraceStatus::Ok | TraceStatus::TracerErr | TraceStatus::Unknown)
    }
}

/// How a traced thread or process terminated
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code
    Code(i32),
    /// Terminated by the given signal
    Signal(i32),
}

/// Offending detail recorded by the vetoing checker
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Canonical syscall number plus the number as the tracee issued it
    Call { number: i64, raw: i64 },
    /// Normalized path and the observed open flags
    Path { path: String, flags: i64 },
    /// Clone flags carrying untraced semantics
    Clone { flags: u64 },
    /// Live task counts when a ceiling was crossed
    Task { processes: usize, threads: usize },
    /// Descriptor count when the ceiling was crossed
    Files { held: u64 },
    /// Cumulative transfer volume and the descriptor's path, if known
    Io { path: Option<String>, bytes: u64 },
    /// Resident memory in bytes
    Memory { bytes: u64 },
    /// CPU time consumed
    Time { user: Duration, sys: Duration },
}

/// Per-process accounting recorded when a process leaves the tree
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessSummary {
    pub pid: i32,
    /// None for processes killed by the tracer during teardown
    pub exit: Option<ExitStatus>,
    /// Peak resident memory in bytes
    pub memory: u64,
    pub user_time: Duration,
    pub sys_time: Duration,
    /// Peak number of live threads
    pub threads: usize,
    pub files_opened: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Final verdict of a trace session
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceResult {
    /// Session identifier shared with every log line of the session
    pub session_id: String,
    pub status: TraceStatus,
    /// Advisory diagnostic, never reparsed
    pub message: Option<String>,
    /// Offending process and thread
    pub epid: Option<i32>,
    pub etid: Option<i32>,
    pub violation: Option<Violation>,
    /// Processes created during the session, root included
    pub nprocess: usize,
    pub exited: Vec<ProcessSummary>,
    pub aborted: Vec<ProcessSummary>,
}

/// Verdict contribution produced by a vetoing checker
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    pub status: TraceStatus,
    pub violation: Option<Violation>,
}

impl Verdict {
    pub fn new(status: TraceStatus, violation: Violation) -> Self {
        Self {
            status,
            violation: Some(violation),
        }
    }
}

/// Error types for the tracer
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tracer backend error: {0}")]
    Backend(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Memory access error at {addr:#x} in pid {pid}: {source}")]
    Memory {
        pid: i32,
        addr: u64,
        source: nix::errno::Errno,
    },

    #[error("Process table error: {0}")]
    Process(String),

    /// The thread disappeared between its stop and our request
    #[error("Tracee {0} vanished")]
    Vanished(i32),
}

pub type Result<T> = std::result::Result<T, TraceError>;

pub(crate) fn to_backend_error(prefix: &str, err: impl std::fmt::Display) -> TraceError {
    TraceError::Backend(format!("{prefix}: {err}"))
}

/// ESRCH from any request aimed at a tracee means the thread is gone, not
/// that tracing broke. Every tracee-directed errno is classified here.
fn gone_or(
    pid: nix::unistd::Pid,
    err: nix::errno::Errno,
    otherwise: impl FnOnce(nix::errno::Errno) -> TraceError,
) -> TraceError {
    if err == nix::errno::Errno::ESRCH {
        TraceError::Vanished(pid.as_raw())
    } else {
        otherwise(err)
    }
}

pub(crate) fn ptrace_error(request: &str, pid: nix::unistd::Pid, err: nix::errno::Errno) -> TraceError {
    gone_or(pid, err, |e| to_backend_error(&format!("{request}({pid})"), e))
}

pub(crate) fn memory_error(pid: nix::unistd::Pid, addr: u64, err: nix::errno::Errno) -> TraceError {
    gone_or(pid, err, |source| TraceError::Memory {
        pid: pid.as_raw(),
        addr,
        source,
    })
}
