//! Memory and CPU-time ceilings.
//!
//! The kernel-side ceilings installed before exec turn into signals; those
//! are classified here. Usage is also re-summed over the live tree on every
//! trap, which catches breaches no single process's rlimit can see.

use super::{undecided, CheckContext};
use crate::config::policy::{Limit, Policy};
use crate::config::types::{ExitStatus, Result, TraceStatus, Verdict, Violation};
use crate::core::trap::{ResourceSample, Trap, TrapKind};

fn timed_out(usage: &ResourceSample, limit: &Limit) -> bool {
    usage.user > limit.user_time || usage.sys > limit.sys_time
}

fn timeout(usage: &ResourceSample) -> Verdict {
    Verdict::new(
        TraceStatus::Timeout,
        Violation::Time {
            user: usage.user,
            sys: usage.sys,
        },
    )
}

fn memout(bytes: u64) -> Verdict {
    Verdict::new(TraceStatus::MemOut, Violation::Memory { bytes })
}

#[derive(Debug)]
pub struct ResourceChecker {
    limit: Limit,
    per_process: Limit,
    verdict: Option<Verdict>,
}

impl Default for ResourceChecker {
    fn default() -> Self {
        Self {
            limit: Limit::unlimited(),
            per_process: Limit::unlimited(),
            verdict: None,
        }
    }
}

impl ResourceChecker {
    pub fn setup(&mut self, policy: &Policy) {
        self.limit = policy.limit.clone();
        self.per_process = policy.per_process.clone();
        self.verdict = None;
    }

    pub fn check(&mut self, ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<bool> {
        let usage = ctx
            .table
            .process(trap.pid)
            .map_or(trap.usage, |p| p.usage);

        let verdict = match &trap.kind {
            TrapKind::Signal {
                signum: libc::SIGSEGV,
            } if usage.memory > self.per_process.memory => Some(memout(usage.memory)),
            TrapKind::Signal {
                signum: libc::SIGXCPU | libc::SIGALRM,
            }
            | TrapKind::ProcessExit {
                status: ExitStatus::Signal(libc::SIGXCPU),
            } => Some(timeout(&usage)),
            _ => None,
        }
        .or_else(|| self.aggregate(ctx));

        match verdict {
            Some(verdict) => {
                log::warn!("Resource ceiling crossed by {}: {:?}", trap.pid, verdict.violation);
                self.verdict = Some(verdict);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    pub fn result(&self, _trap: &Trap) -> Verdict {
        self.verdict.clone().unwrap_or_else(undecided)
    }

    pub fn teardown(&mut self) {
        self.verdict = None;
    }

    /// Per-process time and tree-wide sums of memory and time.
    fn aggregate(&self, ctx: &CheckContext<'_>) -> Option<Verdict> {
        let mut total = ResourceSample::default();
        for process in ctx.table.processes() {
            if timed_out(&process.usage, &self.per_process) {
                return Some(timeout(&process.usage));
            }
            total.memory = total.memory.saturating_add(process.usage.memory);
            total.user = total.user.saturating_add(process.usage.user);
            total.sys = total.sys.saturating_add(process.usage.sys);
        }

        if total.memory > self.limit.memory {
            return Some(memout(total.memory));
        }
        if timed_out(&total, &self.limit) {
            return Some(timeout(&total));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::testing::*;
    use crate::core::process::ProcessTable;
    use crate::kernel::ptrace::memory::testing::FakeMemory;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn checker(policy: &Policy) -> ResourceChecker {
        let mut c = ResourceChecker::default();
        c.setup(policy);
        c
    }

    fn run(c: &mut ResourceChecker, table: &mut ProcessTable, kind: TrapKind) -> bool {
        let memory = FakeMemory::new();
        let mut ctx = CheckContext {
            table,
            memory: &memory,
        };
        let trap = Trap::new(pid(ROOT), pid(ROOT), kind, ResourceSample::default());
        c.check(&mut ctx, &trap).unwrap()
    }

    fn sample(user_ms: u64, memory: u64) -> ResourceSample {
        ResourceSample {
            user: Duration::from_millis(user_ms),
            sys: Duration::ZERO,
            memory,
        }
    }

    #[test]
    fn segv_over_process_memory_is_memout() {
        let mut policy = Policy::default();
        policy.per_process.memory = 64 * MIB;
        let mut c = checker(&policy);
        let mut table = table();

        table.record_usage(pid(ROOT), sample(0, 32 * MIB));
        assert!(run(&mut c, &mut table, TrapKind::Signal { signum: libc::SIGSEGV }));

        table.record_usage(pid(ROOT), sample(0, 65 * MIB));
        assert!(!run(&mut c, &mut table, TrapKind::Signal { signum: libc::SIGSEGV }));
        let verdict = c.result(&Trap::new(pid(ROOT), pid(ROOT), TrapKind::None, sample(0, 0)));
        assert_eq!(verdict.status, TraceStatus::MemOut);
        assert_eq!(verdict.violation, Some(Violation::Memory { bytes: 65 * MIB }));
    }

    #[test]
    fn cpu_limit_signal_is_timeout() {
        let mut c = checker(&Policy::default());
        let mut table = table();
        assert!(!run(&mut c, &mut table, TrapKind::Signal { signum: libc::SIGXCPU }));
        assert_eq!(
            c.result(&Trap::new(pid(ROOT), pid(ROOT), TrapKind::None, sample(0, 0)))
                .status,
            TraceStatus::Timeout
        );

        let mut c = checker(&Policy::default());
        let exit = TrapKind::ProcessExit {
            status: ExitStatus::Signal(libc::SIGXCPU),
        };
        assert!(!run(&mut c, &mut table, exit));
    }

    #[test]
    fn tree_wide_memory_is_summed() {
        let mut policy = Policy::default();
        policy.limit.memory = 100 * MIB;
        let mut c = checker(&policy);
        let mut table = table();
        table.attach_thread(pid(ROOT), pid(ROOT + 1)).unwrap();
        table.promote_to_process(pid(ROOT + 1)).unwrap();

        table.record_usage(pid(ROOT), sample(0, 60 * MIB));
        assert!(run(&mut c, &mut table, TrapKind::None));
        table.record_usage(pid(ROOT + 1), sample(0, 60 * MIB));
        assert!(!run(&mut c, &mut table, TrapKind::None));
    }

    #[test]
    fn per_process_and_total_time() {
        let mut policy = Policy::default();
        policy.per_process.user_time = Duration::from_millis(500);
        policy.limit.user_time = Duration::from_millis(700);
        let mut c = checker(&policy);
        let mut table = table();
        table.attach_thread(pid(ROOT), pid(ROOT + 1)).unwrap();
        table.promote_to_process(pid(ROOT + 1)).unwrap();

        table.record_usage(pid(ROOT), sample(400, 0));
        table.record_usage(pid(ROOT + 1), sample(200, 0));
        assert!(run(&mut c, &mut table, TrapKind::None));

        table.record_usage(pid(ROOT + 1), sample(400, 0));
        assert!(!run(&mut c, &mut table, TrapKind::None));

        // one process alone over its own ceiling
        let mut single = crate::checker::testing::table();
        single.record_usage(pid(ROOT), sample(600, 0));
        let mut c = checker(&policy);
        assert!(!run(&mut c, &mut single, TrapKind::None));
    }
}
