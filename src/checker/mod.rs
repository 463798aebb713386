//! Policy checker pipeline.
//!
//! Each checker inspects every trap and may veto continuation. Checkers run in
//! the order the policy registers them; the first veto stops the remaining
//! checkers and the session, and that checker's [`Checker::result`] supplies
//! the verdict.

pub mod file;
pub mod fork;
pub mod io;
pub mod resource;
pub mod syscall;

use crate::config::policy::{CheckerKind, Policy, TriggerMode};
use crate::config::types::{Result, TraceError, TraceStatus, Verdict};
use crate::core::process::{ProcessTable, ThreadNode};
use crate::core::trap::{CallState, Trap};
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::unistd::Pid;

pub use self::file::FileChecker;
pub use self::fork::ForkChecker;
pub use self::io::IoChecker;
pub use self::resource::ResourceChecker;
pub use self::syscall::SyscallChecker;

/// What a checker may touch while inspecting a trap
pub struct CheckContext<'a> {
    pub table: &'a mut ProcessTable,
    pub memory: &'a dyn TraceeMemory,
}

/// Whether a syscall stop is the configured inspection point.
pub fn at_trigger(trigger: TriggerMode, state: CallState) -> bool {
    matches!(
        (trigger, state),
        (TriggerMode::OnEntry, CallState::CallIn) | (TriggerMode::OnExit, CallState::CallOut)
    )
}

fn unknown_thread(tid: Pid) -> TraceError {
    TraceError::Process(format!("unknown thread {tid}"))
}

pub(crate) fn thread_of(table: &ProcessTable, tid: Pid) -> Result<&ThreadNode> {
    table.thread(tid).ok_or_else(|| unknown_thread(tid))
}

pub(crate) fn thread_of_mut(table: &mut ProcessTable, tid: Pid) -> Result<&mut ThreadNode> {
    table.thread_mut(tid).ok_or_else(|| unknown_thread(tid))
}

/// Verdict reported when a checker is asked for a result it never recorded
fn undecided() -> Verdict {
    Verdict {
        status: TraceStatus::Unknown,
        violation: None,
    }
}

pub enum Checker {
    Syscall(SyscallChecker),
    File(FileChecker),
    Fork(ForkChecker),
    Io(IoChecker),
    Resource(ResourceChecker),
}

impl Checker {
    pub fn new(kind: CheckerKind) -> Self {
        match kind {
            CheckerKind::Syscall => Checker::Syscall(SyscallChecker::default()),
            CheckerKind::File => Checker::File(FileChecker::default()),
            CheckerKind::Fork => Checker::Fork(ForkChecker::default()),
            CheckerKind::Io => Checker::Io(IoChecker::default()),
            CheckerKind::Resource => Checker::Resource(ResourceChecker::default()),
        }
    }

    pub fn kind(&self) -> CheckerKind {
        match self {
            Checker::Syscall(_) => CheckerKind::Syscall,
            Checker::File(_) => CheckerKind::File,
            Checker::Fork(_) => CheckerKind::Fork,
            Checker::Io(_) => CheckerKind::Io,
            Checker::Resource(_) => CheckerKind::Resource,
        }
    }

    pub fn setup(&mut self, policy: &Policy) {
        match self {
            Checker::Syscall(c) => c.setup(policy),
            Checker::File(c) => c.setup(policy),
            Checker::Fork(c) => c.setup(policy),
            Checker::Io(c) => c.setup(policy),
            Checker::Resource(c) => c.setup(policy),
        }
    }

    /// `Ok(false)` vetoes; `Err` is a backend failure, not a policy outcome.
    pub fn check(&mut self, ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<bool> {
        match self {
            Checker::Syscall(c) => c.check(ctx, trap),
            Checker::File(c) => c.check(ctx, trap),
            Checker::Fork(c) => c.check(ctx, trap),
            Checker::Io(c) => c.check(ctx, trap),
            Checker::Resource(c) => c.check(ctx, trap),
        }
    }

    pub fn result(&self, trap: &Trap) -> Verdict {
        match self {
            Checker::Syscall(c) => c.result(trap),
            Checker::File(c) => c.result(trap),
            Checker::Fork(c) => c.result(trap),
            Checker::Io(c) => c.result(trap),
            Checker::Resource(c) => c.result(trap),
        }
    }

    pub fn teardown(&mut self) {
        match self {
            Checker::Syscall(c) => c.teardown(),
            Checker::File(c) => c.teardown(),
            Checker::Fork(c) => c.teardown(),
            Checker::Io(c) => c.teardown(),
            Checker::Resource(c) => c.teardown(),
        }
    }
}

/// Veto raised by one checker
#[derive(Debug, Clone, PartialEq)]
pub struct Veto {
    pub checker: CheckerKind,
    pub verdict: Verdict,
}

pub struct CheckerPipeline {
    checkers: Vec<Checker>,
}

impl CheckerPipeline {
    /// Build and set up the checkers in the policy's registration order.
    pub fn new(policy: &Policy) -> Self {
        let checkers = policy
            .checkers
            .iter()
            .map(|kind| {
                let mut checker = Checker::new(*kind);
                checker.setup(policy);
                checker
            })
            .collect();
        Self { checkers }
    }

    pub fn kinds(&self) -> Vec<CheckerKind> {
        self.checkers.iter().map(Checker::kind).collect()
    }

    pub fn check(&mut self, ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<Option<Veto>> {
        for checker in &mut self.checkers {
            if !checker.check(ctx, trap)? {
                return Ok(Some(Veto {
                    checker: checker.kind(),
                    verdict: checker.result(trap),
                }));
            }
        }
        Ok(None)
    }

    pub fn teardown(&mut self) {
        for checker in &mut self.checkers {
            checker.teardown();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::types::Violation;
    use crate::kernel::abi::sysno;
    use crate::kernel::ptrace::memory::testing::FakeMemory;

    #[test]
    fn pipeline_preserves_registration_order() {
        let mut policy = Policy::default();
        policy.checkers = vec![CheckerKind::Resource, CheckerKind::Syscall];
        let pipeline = CheckerPipeline::new(&policy);
        assert_eq!(pipeline.kinds(), vec![CheckerKind::Resource, CheckerKind::Syscall]);
    }

    #[test]
    fn first_veto_wins() {
        let mut policy = Policy::default();
        policy.calls.deny(sysno::GETPID as usize);
        let mut pipeline = CheckerPipeline::new(&policy);

        let mut table = table();
        let memory = FakeMemory::new();
        let mut ctx = CheckContext {
            table: &mut table,
            memory: &memory,
        };
        let trap = syscall_trap(ROOT, call(sysno::GETPID, [0; 6], ROOT as i64), CallState::CallOut);

        let veto = pipeline.check(&mut ctx, &trap).unwrap().unwrap();
        assert_eq!(veto.checker, CheckerKind::Syscall);
        assert_eq!(veto.verdict.status, TraceStatus::CallDeny);
        assert_eq!(
            veto.verdict.violation,
            Some(Violation::Call {
                number: sysno::GETPID,
                raw: sysno::GETPID
            })
        );
    }

    #[test]
    fn trigger_matches_call_state() {
        assert!(at_trigger(TriggerMode::OnEntry, CallState::CallIn));
        assert!(!at_trigger(TriggerMode::OnEntry, CallState::CallOut));
        assert!(at_trigger(TriggerMode::OnExit, CallState::CallOut));
    }
}
