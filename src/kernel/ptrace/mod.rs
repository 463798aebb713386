//! ptrace(2) tracing backend.
//!
//! Every stop of every traced task funnels through [`PtraceBackend::trap`],
//! which keeps the process table consistent with the kernel's view:
//!
//! - clone/fork/vfork events attach the new task to its spawner's process and
//!   are reported as the spawner's syscall return, carrying the new tid. The
//!   real syscall-exit stop that follows is swallowed.
//! - A new task's first SIGSTOP is paired with its parent's event in
//!   [`correlate::PendingTable`] regardless of arrival order. A task whose
//!   first stop came first stays stopped until the parent's event trap has
//!   been checked and stepped.
//! - exec events collapse the exec'ing thread group onto the leader's tid and
//!   invalidate the cached calling convention.
//! - syscall-exit stops report the number and arguments decoded at entry;
//!   only the return value is read at exit.
//!
//! The backend waits for any child of the calling thread. A session owns that
//! thread's children while it runs, so the embedding program must not fork
//! untraced children from the thread driving the session.

pub mod correlate;
pub mod memory;
pub mod spawn;
pub mod wait;

use crate::config::policy::{Entry, Policy};
use crate::config::types::{ptrace_error, ExitStatus, Result, TraceError};
use crate::core::handles::{FileSet, WorkingDir};
use crate::core::process::ProcessTable;
use crate::core::trap::{CallState, ResourceSample, Trap, TrapKind};
use crate::kernel::abi::{self, SyscallInfo};
use crate::kernel::backend::TraceBackend;
use self::correlate::{ChildStop, PendingTable, QueuedStop};
use self::memory::{PtraceMemory, TraceeMemory};
use self::wait::{WaitEvent, WaitReport};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;

/// Upper bound on waiting for killed tasks that never report
const REAP_WINDOW: Duration = Duration::from_secs(1);

pub struct PtraceBackend {
    memory: PtraceMemory,
    pending: PendingTable,
    session_id: String,
}

impl PtraceBackend {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            memory: PtraceMemory,
            pending: PendingTable::new(),
            session_id: session_id.into(),
        }
    }

    /// Restart `tid` until its next syscall boundary, delivering `signal`.
    ///
    /// A thread killed by a sibling's exit_group while stopped can no longer
    /// be restarted; its exit is still reported by wait, so ESRCH is benign.
    fn resume(&self, tid: Pid, signal: i32) -> Result<()> {
        // SAFETY: PTRACE_SYSCALL takes the signal number in the data word; no
        // memory is passed.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SYSCALL,
                tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                signal as libc::c_long as *mut libc::c_void,
            )
        };
        match Errno::result(rc).map_err(|e| ptrace_error("PTRACE_SYSCALL", tid, e)) {
            Ok(_) => Ok(()),
            Err(TraceError::Vanished(_)) => {
                log::debug!("[{}] Thread {} gone before resume", self.session_id, tid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn event_message(tid: Pid) -> Result<Pid> {
        ptrace::getevent(tid)
            .map(|msg| Pid::from_raw(msg as libc::pid_t))
            .map_err(|e| ptrace_error("PTRACE_GETEVENTMSG", tid, e))
    }

    fn decode(&self, table: &mut ProcessTable, tid: Pid, state: CallState) -> Result<SyscallInfo> {
        let regs = abi::read_registers(tid)?;
        let pid = table
            .thread(tid)
            .map(|t| t.process)
            .ok_or_else(|| TraceError::Process(format!("unknown thread {tid}")))?;

        let mode = match table.process(pid).and_then(|p| p.compat) {
            Some(mode) => mode,
            None => {
                let mode = abi::detect_mode(&self.memory, tid, &regs)?;
                if let Some(process) = table.process_mut(pid) {
                    process.compat = Some(mode);
                }
                mode
            }
        };

        let mut call = abi::strategy(mode).decode(&regs);
        if state == CallState::CallIn {
            abi::demultiplex(&self.memory, tid, &mut call)?;
        }
        let thread = table
            .thread_mut(tid)
            .ok_or_else(|| TraceError::Process(format!("unknown thread {tid}")))?;
        Ok(thread.settle_syscall(state, call))
    }

    fn syscall_stop(
        &mut self,
        table: &mut ProcessTable,
        pid: Pid,
        tid: Pid,
        usage: ResourceSample,
    ) -> Result<Option<Trap>> {
        let Some(thread) = table.thread_mut(tid) else {
            return Ok(None);
        };
        if thread.clone_return_reported {
            thread.clone_return_reported = false;
            self.resume(tid, 0)?;
            return Ok(None);
        }
        let state = thread.state.toggled();
        thread.state = state;

        let call = self.decode(table, tid, state)?;
        Ok(Some(Trap::new(pid, tid, TrapKind::Syscall { call, state }, usage)))
    }

    fn event_stop(
        &mut self,
        table: &mut ProcessTable,
        pid: Pid,
        tid: Pid,
        event: i32,
        usage: ResourceSample,
    ) -> Result<Option<Trap>> {
        match event {
            libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                let child = Self::event_message(tid)?;
                let order = self.pending.parent_event(tid, child);
                table.attach_thread(tid, child)?;
                log::debug!(
                    "[{}] Thread {} spawned {} ({:?})",
                    self.session_id,
                    tid,
                    child,
                    order
                );

                let mut call = self.decode(table, tid, CallState::CallOut)?;
                call.retval = child.as_raw() as i64;
                if let Some(thread) = table.thread_mut(tid) {
                    thread.state = CallState::CallOut;
                    thread.clone_return_reported = true;
                }

                let mut trap = Trap::new(
                    pid,
                    tid,
                    TrapKind::Syscall {
                        call,
                        state: CallState::CallOut,
                    },
                    usage,
                );
                trap.spawned = Some(child);
                Ok(Some(trap))
            }
            libc::PTRACE_EVENT_EXEC => {
                let former = Self::event_message(tid)?;
                let vanished = table.collapse_after_exec(tid, former)?;
                for gone in vanished {
                    self.pending.forget(gone);
                }
                log::debug!(
                    "[{}] Process {} exec'd (from thread {})",
                    self.session_id,
                    tid,
                    former
                );
                self.resume(tid, 0)?;
                Ok(None)
            }
            _ => Ok(Some(Trap::new(pid, tid, TrapKind::None, usage))),
        }
    }

    fn signal_stop(
        &mut self,
        pid: Pid,
        tid: Pid,
        report: &WaitReport,
        signum: i32,
    ) -> Result<Option<Trap>> {
        if signum == libc::SIGSTOP && self.pending.is_announced(tid) {
            let stop = QueuedStop {
                status: report.status,
                usage: report.usage,
            };
            if let ChildStop::Recovered { parent } = self.pending.child_stopped(tid, stop) {
                log::debug!(
                    "[{}] First stop of {} claimed by {}",
                    self.session_id,
                    tid,
                    parent
                );
            }
            self.resume(tid, 0)?;
            return Ok(None);
        }

        // Group-stops have no siginfo; restarting must not re-inject the signal.
        if matches!(
            signum,
            libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
        ) && matches!(ptrace::getsiginfo(tid), Err(Errno::EINVAL))
        {
            self.resume(tid, 0)?;
            return Ok(None);
        }

        Ok(Some(Trap::new(
            pid,
            tid,
            TrapKind::Signal { signum },
            report.usage,
        )))
    }

    fn untracked(&mut self, report: &WaitReport, event: WaitEvent) {
        match event {
            WaitEvent::SignalStop(_) => {
                let stop = QueuedStop {
                    status: report.status,
                    usage: report.usage,
                };
                if self.pending.child_stopped(report.pid, stop) == ChildStop::Queued {
                    log::debug!(
                        "[{}] Holding {} until its parent reports it",
                        self.session_id,
                        report.pid
                    );
                }
            }
            WaitEvent::Exited(_) | WaitEvent::Signaled(_) => {
                self.pending.forget(report.pid);
                log::debug!("[{}] Ignoring exit of untracked {}", self.session_id, report.pid);
            }
            other => {
                log::debug!(
                    "[{}] Ignoring {:?} from untracked {}",
                    self.session_id,
                    other,
                    report.pid
                );
            }
        }
    }
}

impl TraceBackend for PtraceBackend {
    fn backend_name(&self) -> &str {
        "ptrace"
    }

    fn spawn(&mut self, entry: &Entry, policy: &Policy, table: &mut ProcessTable) -> Result<Pid> {
        let root = spawn::spawn_tracee(entry, &policy.per_process)?;
        table.insert_root(
            root,
            FileSet::with_stdio(),
            WorkingDir::new(entry.cwd.to_string_lossy().into_owned()),
        );
        self.resume(root, 0)?;
        log::info!(
            "[{}] Tracing {:?} as pid {}",
            self.session_id,
            entry.path,
            root
        );
        Ok(root)
    }

    fn trap(&mut self, table: &mut ProcessTable) -> Result<Trap> {
        loop {
            let report = wait::wait_any()?;
            let tid = report.pid;
            let Some(event) = report.event() else {
                continue;
            };
            let Some(pid) = table.thread(tid).map(|t| t.process) else {
                self.untracked(&report, event);
                continue;
            };
            table.record_usage(pid, report.usage);

            let outcome = match event {
                WaitEvent::Exited(code) => {
                    self.pending.forget(tid);
                    let status = ExitStatus::Code(code);
                    Ok(Some(Trap::new(pid, tid, TrapKind::ProcessExit { status }, report.usage)))
                }
                WaitEvent::Signaled(signum) => {
                    self.pending.forget(tid);
                    let status = ExitStatus::Signal(signum);
                    Ok(Some(Trap::new(pid, tid, TrapKind::ProcessExit { status }, report.usage)))
                }
                WaitEvent::SyscallStop => self.syscall_stop(table, pid, tid, report.usage),
                WaitEvent::EventStop(code) => self.event_stop(table, pid, tid, code, report.usage),
                WaitEvent::SignalStop(signum) => self.signal_stop(pid, tid, &report, signum),
                WaitEvent::Continued => Ok(None),
            };

            match outcome {
                Ok(Some(trap)) => return Ok(trap),
                Ok(None) => continue,
                Err(TraceError::Vanished(gone)) => {
                    log::debug!("[{}] Thread {} vanished mid-stop", self.session_id, gone);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn step(&mut self, trap: &Trap, table: &ProcessTable) -> Result<()> {
        match &trap.kind {
            TrapKind::ProcessExit { .. } => {}
            TrapKind::Signal { signum } => self.resume(trap.tid, *signum)?,
            TrapKind::Syscall { .. } | TrapKind::None => self.resume(trap.tid, 0)?,
        }

        // A child whose first stop came before this event is still stopped.
        if let Some(child) = trap.spawned {
            if table.thread(child).is_some() && !self.pending.is_announced(child) {
                self.resume(child, 0)?;
            }
        }
        Ok(())
    }

    fn kill(&mut self, pid: Pid) -> Result<()> {
        match kill(pid, Signal::SIGKILL).map_err(|e| ptrace_error("kill", pid, e)) {
            Ok(()) | Err(TraceError::Vanished(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn kill_all(&mut self, table: &ProcessTable) {
        let mut victims = table.tids();
        victims.extend(self.pending.stopped());

        for tid in &victims {
            if let Err(e) = self.kill(*tid) {
                log::warn!("[{}] Failed to kill {}: {}", self.session_id, tid, e);
            }
        }
        self.pending.clear();

        let reaped = wait::reap_all(&victims, REAP_WINDOW);
        log::debug!(
            "[{}] Killed {} tasks, reaped {} statuses",
            self.session_id,
            victims.len(),
            reaped
        );
    }

    fn memory(&self) -> &dyn TraceeMemory {
        &self.memory
    }
}
