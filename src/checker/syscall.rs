//! Syscall allow-set enforcement.

use super::{at_trigger, undecided, CheckContext};
use crate::config::policy::{Policy, SyscallSet, TriggerMode};
use crate::config::types::{Result, TraceStatus, Verdict, Violation};
use crate::core::trap::Trap;
use crate::kernel::abi::sysno::CANONICAL_MAX;

#[derive(Debug, Default)]
pub struct SyscallChecker {
    calls: SyscallSet,
    trigger: TriggerMode,
}

impl SyscallChecker {
    pub fn setup(&mut self, policy: &Policy) {
        self.calls = policy.calls.clone();
        self.trigger = policy.trigger;
    }

    pub fn check(&mut self, _ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<bool> {
        let Some((call, state)) = trap.syscall() else {
            return Ok(true);
        };
        if !at_trigger(self.trigger, state) {
            return Ok(true);
        }

        let in_range = (0..CANONICAL_MAX as i64).contains(&call.number);
        if in_range && self.calls.contains(call.number) {
            return Ok(true);
        }

        log::warn!(
            "Denied syscall {} ({}) from tid {}",
            call.number,
            crate::kernel::abi::sysno::name_of(call.number as usize).unwrap_or("?"),
            trap.tid
        );
        Ok(false)
    }

    pub fn result(&self, trap: &Trap) -> Verdict {
        match trap.syscall() {
            Some((call, _)) => Verdict::new(
                TraceStatus::CallDeny,
                Violation::Call {
                    number: call.number,
                    raw: call.raw as i64,
                },
            ),
            None => undecided(),
        }
    }

    pub fn teardown(&mut self) {}
}
