//! Task creation: placement of new tasks and process/thread quotas.

use super::{thread_of_mut, undecided, CheckContext};
use crate::config::policy::{Limit, Policy};
use crate::config::types::{Result, TraceStatus, Verdict, Violation};
use crate::core::trap::{CallState, Trap};
use crate::kernel::abi::{sysno, SyscallInfo};
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::unistd::Pid;

/// Clone flags a spawning call asked for.
fn clone_flags(memory: &dyn TraceeMemory, tid: Pid, call: &SyscallInfo) -> Result<Option<u64>> {
    Ok(match call.number {
        sysno::CLONE => Some(call.arg(0)),
        // struct clone_args starts with the u64 flags word
        sysno::CLONE3 => Some(memory.read_u64(tid, call.arg(0))?),
        sysno::FORK => Some(libc::SIGCHLD as u64),
        sysno::VFORK => Some((libc::CLONE_VM | libc::CLONE_VFORK | libc::SIGCHLD) as u64),
        _ => None,
    })
}

fn has(flags: u64, flag: libc::c_int) -> bool {
    flags & flag as u64 != 0
}

#[derive(Debug)]
pub struct ForkChecker {
    nprocess: u64,
    limit: Limit,
    per_process: Limit,
    verdict: Option<Verdict>,
}

impl Default for ForkChecker {
    fn default() -> Self {
        Self {
            nprocess: u64::MAX,
            limit: Limit::unlimited(),
            per_process: Limit::unlimited(),
            verdict: None,
        }
    }
}

impl ForkChecker {
    pub fn setup(&mut self, policy: &Policy) {
        self.nprocess = policy.nprocess;
        self.limit = policy.limit.clone();
        self.per_process = policy.per_process.clone();
        self.verdict = None;
    }

    pub fn check(&mut self, ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<bool> {
        let Some((call, state)) = trap.syscall() else {
            return Ok(true);
        };
        let Some(flags) = clone_flags(ctx.memory, trap.tid, call)? else {
            return Ok(true);
        };

        match state {
            CallState::CallIn => {
                if has(flags, libc::CLONE_UNTRACED) {
                    log::warn!("tid {} asked for an untraced clone ({:#x})", trap.tid, flags);
                    self.verdict = Some(Verdict::new(
                        TraceStatus::CloneDeny,
                        Violation::Clone { flags },
                    ));
                    return Ok(false);
                }
                Ok(true)
            }
            CallState::CallOut => match trap.spawned {
                Some(child) => self.place(ctx, trap.tid, child, flags),
                None => Ok(true),
            },
        }
    }

    pub fn result(&self, _trap: &Trap) -> Verdict {
        self.verdict.clone().unwrap_or_else(undecided)
    }

    pub fn teardown(&mut self) {
        self.verdict = None;
    }

    /// Settle where `child` lives now that its clone flags are known, then
    /// enforce the task quotas.
    fn place(&mut self, ctx: &mut CheckContext<'_>, spawner: Pid, child: Pid, flags: u64) -> Result<bool> {
        let table = &mut *ctx.table;
        if !has(flags, libc::CLONE_THREAD) {
            table.promote_to_process(child)?;
        }
        let node = thread_of_mut(table, child)?;
        if !has(flags, libc::CLONE_FILES) {
            node.files.own();
        }
        if !has(flags, libc::CLONE_FS) {
            node.cwd.own();
        }
        let pid = node.process;
        table.refresh_peak(pid);
        log::debug!("tid {} spawned {} into process {} ({:#x})", spawner, child, pid, flags);

        let processes = table.live_processes();
        let threads = table.live_threads();
        let in_process = table.process(pid).map_or(0, |p| p.threads.len());

        let over = processes as u64 > self.nprocess
            || threads as u64 > self.limit.threads
            || in_process as u64 > self.per_process.threads;
        if over {
            log::warn!(
                "Task quota exceeded: {} processes, {} threads ({} in {})",
                processes,
                threads,
                in_process,
                pid
            );
            self.verdict = Some(Verdict::new(
                TraceStatus::TaskOut,
                Violation::Task { processes, threads },
            ));
            return Ok(false);
        }
        Ok(true)
    }
}
