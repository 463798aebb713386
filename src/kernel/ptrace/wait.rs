//! Waiting for tracee stops and decoding raw wait statuses.

use crate::config::types::{to_backend_error, Result};
use crate::core::trap::ResourceSample;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Stop signal of a syscall stop under PTRACE_O_TRACESYSGOOD
const SYSCALL_STOP: i32 = libc::SIGTRAP | 0x80;

const REAP_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitEvent {
    Exited(i32),
    Signaled(i32),
    SyscallStop,
    /// PTRACE_EVENT_* stop
    EventStop(i32),
    /// Signal-delivery (or group) stop with the given signal
    SignalStop(i32),
    Continued,
}

impl WaitEvent {
    pub fn decode(status: i32) -> Option<WaitEvent> {
        if libc::WIFEXITED(status) {
            return Some(WaitEvent::Exited(libc::WEXITSTATUS(status)));
        }
        if libc::WIFSIGNALED(status) {
            return Some(WaitEvent::Signaled(libc::WTERMSIG(status)));
        }
        if libc::WIFSTOPPED(status) {
            let sig = libc::WSTOPSIG(status);
            let event = (status >> 16) & 0xff;
            return Some(if sig == SYSCALL_STOP {
                WaitEvent::SyscallStop
            } else if sig == libc::SIGTRAP && event != 0 {
                WaitEvent::EventStop(event)
            } else {
                WaitEvent::SignalStop(sig)
            });
        }
        if libc::WIFCONTINUED(status) {
            return Some(WaitEvent::Continued);
        }
        None
    }
}

/// One reaped wait status
#[derive(Clone, Copy, Debug)]
pub struct WaitReport {
    pub pid: Pid,
    pub status: i32,
    pub usage: ResourceSample,
}

impl WaitReport {
    pub fn event(&self) -> Option<WaitEvent> {
        WaitEvent::decode(self.status)
    }

    /// The task is dead and this status released it.
    pub fn is_final(&self) -> bool {
        matches!(
            self.event(),
            Some(WaitEvent::Exited(_) | WaitEvent::Signaled(_))
        )
    }
}

fn duration(tv: libc::timeval) -> Duration {
    let secs = tv.tv_sec.max(0) as u64;
    let micros = tv.tv_usec.clamp(0, 999_999) as u32;
    Duration::new(secs, micros * 1000)
}

fn sample(ru: &libc::rusage) -> ResourceSample {
    ResourceSample {
        user: duration(ru.ru_utime),
        sys: duration(ru.ru_stime),
        // kilobytes on Linux
        memory: (ru.ru_maxrss.max(0) as u64).saturating_mul(1024),
    }
}

fn wait4(pid: libc::pid_t, flags: libc::c_int) -> std::result::Result<Option<WaitReport>, Errno> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain integers; all-zero is a valid value.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: status and rusage are valid out-pointers for the call's duration.
        let rc = unsafe { libc::wait4(pid, &mut status, flags | libc::__WALL | libc::__WNOTHREAD, &mut ru) };
        match Errno::result(rc) {
            Ok(0) => return Ok(None),
            Ok(reaped) => {
                return Ok(Some(WaitReport {
                    pid: Pid::from_raw(reaped),
                    status,
                    usage: sample(&ru),
                }))
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Block until any child of the calling thread changes state. Every such
/// child is expected to be a tracee of the running session.
pub fn wait_any() -> Result<WaitReport> {
    wait4(-1, 0)
        .map_err(|e| to_backend_error("wait4", e))?
        .ok_or_else(|| to_backend_error("wait4", "no status reported"))
}

/// Block until `pid` changes state.
pub fn wait_for(pid: Pid) -> Result<WaitReport> {
    wait4(pid.as_raw(), 0)
        .map_err(|e| to_backend_error(&format!("wait4({pid})"), e))?
        .ok_or_else(|| to_backend_error("wait4", "no status reported"))
}

/// Collect the final status of every task in `tids`, returning as soon as
/// all of them are gone. A task already reaped elsewhere counts as gone.
/// `window` bounds the wait for tasks the kernel keeps from reporting, such
/// as a leader whose unseen new thread still awaits its tracer.
pub fn reap_all(tids: &[Pid], window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut outstanding = tids.to_vec();
    let mut reaped = 0;

    while !outstanding.is_empty() {
        let before = outstanding.len();
        outstanding.retain(|tid| match wait4(tid.as_raw(), libc::WNOHANG) {
            Ok(Some(report)) if report.is_final() => {
                reaped += 1;
                false
            }
            Ok(_) => true,
            Err(_) => false,
        });
        if outstanding.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            log::debug!("Gave up reaping {:?}", outstanding);
            break;
        }
        if outstanding.len() == before {
            std::thread::sleep(REAP_POLL);
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw statuses as the kernel encodes them
    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn stopped(sig: i32, event: i32) -> i32 {
        (event << 16) | (sig << 8) | 0x7f
    }

    #[test]
    fn decodes_exit_and_termination() {
        assert_eq!(WaitEvent::decode(exited(3)), Some(WaitEvent::Exited(3)));
        assert_eq!(
            WaitEvent::decode(libc::SIGKILL),
            Some(WaitEvent::Signaled(libc::SIGKILL))
        );
    }

    #[test]
    fn syscall_stop_is_distinct_from_plain_sigtrap() {
        assert_eq!(
            WaitEvent::decode(stopped(SYSCALL_STOP, 0)),
            Some(WaitEvent::SyscallStop)
        );
        assert_eq!(
            WaitEvent::decode(stopped(libc::SIGTRAP, 0)),
            Some(WaitEvent::SignalStop(libc::SIGTRAP))
        );
    }

    #[test]
    fn event_number_comes_from_high_bits() {
        assert_eq!(
            WaitEvent::decode(stopped(libc::SIGTRAP, libc::PTRACE_EVENT_CLONE)),
            Some(WaitEvent::EventStop(libc::PTRACE_EVENT_CLONE))
        );
        assert_eq!(
            WaitEvent::decode(stopped(libc::SIGTRAP, libc::PTRACE_EVENT_EXEC)),
            Some(WaitEvent::EventStop(libc::PTRACE_EVENT_EXEC))
        );
    }

    #[test]
    fn signal_stop_keeps_signal() {
        assert_eq!(
            WaitEvent::decode(stopped(libc::SIGSTOP, 0)),
            Some(WaitEvent::SignalStop(libc::SIGSTOP))
        );
        assert_eq!(WaitEvent::decode(0xffff), Some(WaitEvent::Continued));
    }

    #[test]
    fn only_exits_are_final() {
        let report = |status| WaitReport {
            pid: Pid::from_raw(1),
            status,
            usage: ResourceSample::default(),
        };
        assert!(report(exited(0)).is_final());
        assert!(report(libc::SIGKILL).is_final());
        assert!(!report(stopped(SYSCALL_STOP, 0)).is_final());
    }

    #[test]
    fn reaping_stops_once_known_tasks_are_gone() {
        // neither pid is a child of the test thread: ECHILD retires both at once
        let start = Instant::now();
        let strangers = [Pid::from_raw(i32::MAX - 1), Pid::from_raw(i32::MAX - 2)];
        let reaped = reap_all(&strangers, Duration::from_secs(5));
        assert_eq!(reaped, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(reap_all(&[], Duration::from_secs(5)), 0);
    }

    #[test]
    fn rusage_memory_is_reported_in_bytes() {
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        ru.ru_maxrss = 2048;
        ru.ru_utime.tv_sec = 1;
        ru.ru_utime.tv_usec = 500_000;
        let s = sample(&ru);
        assert_eq!(s.memory, 2048 * 1024);
        assert_eq!(s.user, Duration::from_millis(1500));
    }
}
