//! Normalized stop events handed from the backend to the checkers.

use crate::config::types::ExitStatus;
use crate::kernel::abi::SyscallInfo;
use nix::unistd::Pid;
use std::time::Duration;

/// Resource usage reported alongside a stop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub user: Duration,
    pub sys: Duration,
    /// Peak resident memory in bytes
    pub memory: u64,
}

/// Which side of a syscall the thread is stopped at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    CallIn,
    CallOut,
}

impl CallState {
    pub fn toggled(self) -> CallState {
        match self {
            CallState::CallIn => CallState::CallOut,
            CallState::CallOut => CallState::CallIn,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrapKind {
    Syscall { call: SyscallInfo, state: CallState },
    /// Signal delivery stop; the signal is re-injected on resume
    Signal { signum: i32 },
    /// Thread exit. A process exits with its last thread.
    ProcessExit { status: ExitStatus },
    /// Stops that carry nothing for the checkers
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trap {
    pub pid: Pid,
    pub tid: Pid,
    pub kind: TrapKind,
    pub usage: ResourceSample,
    /// New task reported by a clone/fork/vfork return
    pub spawned: Option<Pid>,
}

impl Trap {
    pub fn new(pid: Pid, tid: Pid, kind: TrapKind, usage: ResourceSample) -> Self {
        Self {
            pid,
            tid,
            kind,
            usage,
            spawned: None,
        }
    }

    pub fn syscall(&self) -> Option<(&SyscallInfo, CallState)> {
        match &self.kind {
            TrapKind::Syscall { call, state } => Some((call, *state)),
            _ => None,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, TrapKind::ProcessExit { .. })
    }
}
