//! Tracing backend abstraction.
//!
//! The session drives a backend through spawn → trap/step … → kill_all. The
//! ptrace implementation lives in [`crate::kernel::ptrace`]; tests substitute
//! a scripted one.

use crate::config::policy::{Entry, Policy};
use crate::config::types::Result;
use crate::core::process::ProcessTable;
use crate::core::trap::Trap;
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::unistd::Pid;

pub trait TraceBackend {
    fn backend_name(&self) -> &str;

    /// Start the root tracee and register it in `table`.
    fn spawn(&mut self, entry: &Entry, policy: &Policy, table: &mut ProcessTable) -> Result<Pid>;

    /// Block for the next stop worth checking, keeping `table` in step with
    /// clone and exec events.
    fn trap(&mut self, table: &mut ProcessTable) -> Result<Trap>;

    /// Resume the thread stopped at `trap` (and any child held behind it).
    fn step(&mut self, trap: &Trap, table: &ProcessTable) -> Result<()>;

    fn kill(&mut self, pid: Pid) -> Result<()>;

    /// Kill and reap every task still known, including unclaimed new ones.
    fn kill_all(&mut self, table: &ProcessTable);

    fn memory(&self) -> &dyn TraceeMemory;
}
