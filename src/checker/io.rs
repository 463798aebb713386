//! Cumulative read/write accounting.

use super::{thread_of, undecided, CheckContext};
use crate::config::policy::{Limit, Policy};
use crate::config::types::{Result, TraceStatus, Verdict, Violation};
use crate::core::trap::{CallState, Trap};
use crate::kernel::abi::{sysno, SyscallInfo};
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::unistd::Pid;

/// Upper bound on mmsghdr entries walked per call (UIO_MAXIOV)
const MMSG_MAX: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

fn direction(number: i64) -> Option<Direction> {
    match number {
        sysno::READ
        | sysno::PREAD64
        | sysno::READV
        | sysno::PREADV
        | sysno::PREADV2
        | sysno::RECVFROM
        | sysno::RECVMSG
        | sysno::RECVMMSG => Some(Direction::Read),
        sysno::WRITE
        | sysno::PWRITE64
        | sysno::WRITEV
        | sysno::PWRITEV
        | sysno::PWRITEV2
        | sysno::SENDTO
        | sysno::SENDMSG
        | sysno::SENDMMSG => Some(Direction::Write),
        _ => None,
    }
}

/// Bytes a completed call moved. The mmsg calls return a message count, so
/// their byte total is summed from each header's `msg_len`.
fn transferred(memory: &dyn TraceeMemory, tid: Pid, call: &SyscallInfo) -> Result<u64> {
    if !matches!(call.number, sysno::RECVMMSG | sysno::SENDMMSG) {
        return Ok(call.retval as u64);
    }
    let count = (call.retval as u64).min(MMSG_MAX);
    let stride = call.mode.mmsghdr_size();
    let offset = call.mode.mmsghdr_len_offset();
    let base = call.arg(1);

    let mut total = 0u64;
    for i in 0..count {
        let at = base.wrapping_add(i * stride).wrapping_add(offset);
        total = total.saturating_add(memory.read_u32(tid, at)? as u64);
    }
    Ok(total)
}

#[derive(Debug)]
pub struct IoChecker {
    limit: Limit,
    per_process: Limit,
    total_read: u64,
    total_written: u64,
    verdict: Option<Verdict>,
}

impl Default for IoChecker {
    fn default() -> Self {
        Self {
            limit: Limit::unlimited(),
            per_process: Limit::unlimited(),
            total_read: 0,
            total_written: 0,
            verdict: None,
        }
    }
}

impl IoChecker {
    pub fn setup(&mut self, policy: &Policy) {
        self.limit = policy.limit.clone();
        self.per_process = policy.per_process.clone();
        self.total_read = 0;
        self.total_written = 0;
        self.verdict = None;
    }

    pub fn check(&mut self, ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<bool> {
        let Some((call, state)) = trap.syscall() else {
            return Ok(true);
        };
        if state != CallState::CallOut || call.retval <= 0 {
            return Ok(true);
        }
        let Some(direction) = direction(call.number) else {
            return Ok(true);
        };

        let bytes = transferred(ctx.memory, trap.tid, call)?;
        let fd = call.arg_int(0);
        let files = &thread_of(ctx.table, trap.tid)?.files;

        let (process_total, session_total, process_limit, session_limit, status) = match direction {
            Direction::Read => {
                self.total_read = self.total_read.saturating_add(bytes);
                (
                    files.add_read(fd, bytes),
                    self.total_read,
                    self.per_process.io_read,
                    self.limit.io_read,
                    TraceStatus::ReadOut,
                )
            }
            Direction::Write => {
                self.total_written = self.total_written.saturating_add(bytes);
                (
                    files.add_written(fd, bytes),
                    self.total_written,
                    self.per_process.io_write,
                    self.limit.io_write,
                    TraceStatus::WriteOut,
                )
            }
        };

        let over = if process_total > process_limit {
            Some(process_total)
        } else if session_total > session_limit {
            Some(session_total)
        } else {
            None
        };
        let Some(total) = over else {
            return Ok(true);
        };

        let path = files.path_of(fd);
        log::warn!(
            "{:?} ceiling crossed by tid {} on fd {} ({:?}): {} bytes",
            direction,
            trap.tid,
            fd,
            path,
            total
        );
        self.verdict = Some(Verdict::new(status, Violation::Io { path, bytes: total }));
        Ok(false)
    }

    pub fn result(&self, _trap: &Trap) -> Verdict {
        self.verdict.clone().unwrap_or_else(undecided)
    }

    pub fn teardown(&mut self) {
        self.verdict = None;
    }
}
