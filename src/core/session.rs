//! The trace-inspect-decide loop.
//!
//! A session spawns one root tracee and serializes every stop of its process
//! tree through `backend.trap()`. Each trap runs the checker pipeline; a veto
//! or a backend failure kills everything still alive and settles the
//! verdict. The session succeeds when the tree drains with no veto.

use crate::checker::{CheckContext, CheckerPipeline, Veto};
use crate::config::policy::{Entry, Policy};
use crate::config::types::{
    ExitStatus, ProcessSummary, Result, TraceError, TraceResult, TraceStatus,
};
use crate::config::validator::{validate_entry, validate_policy};
use crate::core::process::ProcessTable;
use crate::core::trap::{Trap, TrapKind};
use crate::kernel::backend::TraceBackend;
use crate::kernel::ptrace::PtraceBackend;
use uuid::Uuid;

/// Identity of one session, carried on every log line it emits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub id: Uuid,
}

impl SessionContext {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Spawning,
    Running,
    /// Killing what is left after a veto or a backend failure
    Draining,
    Done,
}

/// Stops whose task died under us; the kernel still reports its exit.
fn vanished(err: &TraceError) -> bool {
    matches!(err, TraceError::Vanished(_))
}

pub struct TraceSession<B: TraceBackend> {
    ctx: SessionContext,
    policy: Policy,
    backend: B,
    pipeline: CheckerPipeline,
    table: ProcessTable,
    state: SessionState,
    exited: Vec<ProcessSummary>,
}

impl TraceSession<PtraceBackend> {
    /// Session over the ptrace backend with a fresh identity.
    pub fn ptrace(policy: Policy) -> Result<Self> {
        let ctx = SessionContext::new();
        let backend = PtraceBackend::new(ctx.id.to_string());
        Self::new(ctx, policy, backend)
    }
}

impl<B: TraceBackend> TraceSession<B> {
    /// Rejects a malformed policy before anything is spawned.
    pub fn new(ctx: SessionContext, policy: Policy, backend: B) -> Result<Self> {
        validate_policy(&policy)?;
        let pipeline = CheckerPipeline::new(&policy);
        log::debug!(
            "[{}] Session over {} with checkers {:?}",
            ctx.id,
            backend.backend_name(),
            pipeline.kinds()
        );
        Ok(Self {
            ctx,
            policy,
            backend,
            pipeline,
            table: ProcessTable::new(),
            state: SessionState::Spawning,
            exited: Vec::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Trace `entry` to completion.
    ///
    /// `Err` is returned only for a malformed entry; every outcome after that,
    /// spawn failure included, is a [`TraceResult`].
    pub fn run(&mut self, entry: &Entry) -> Result<TraceResult> {
        validate_entry(entry)?;
        self.state = SessionState::Spawning;

        if let Err(e) = self.backend.spawn(entry, &self.policy, &mut self.table) {
            return Ok(self.fail(e));
        }
        self.state = SessionState::Running;

        while !self.table.is_empty() {
            let trap = match self.backend.trap(&mut self.table) {
                Ok(trap) => trap,
                Err(e) => return Ok(self.fail(e)),
            };

            let mut ctx = CheckContext {
                table: &mut self.table,
                memory: self.backend.memory(),
            };
            match self.pipeline.check(&mut ctx, &trap) {
                Ok(None) => {}
                Ok(Some(veto)) => return Ok(self.veto(veto, &trap)),
                Err(e) if vanished(&e) => {
                    log::debug!("[{}] Checks skipped for {}: {}", self.ctx.id, trap.tid, e);
                }
                Err(e) => return Ok(self.fail(e)),
            }

            if let TrapKind::ProcessExit { status } = &trap.kind {
                self.retire(&trap, *status);
                continue;
            }
            if let Err(e) = self.backend.step(&trap, &self.table) {
                return Ok(self.fail(e));
            }
        }

        // Nothing tracked is left; stray stopped tasks still get killed.
        self.backend.kill_all(&self.table);
        Ok(self.finish(TraceResult {
            status: TraceStatus::Ok,
            ..TraceResult::default()
        }))
    }

    /// Take an exited thread out of the tree, summarizing its process if it
    /// was the last one.
    fn retire(&mut self, trap: &Trap, status: ExitStatus) {
        let Some(removal) = self.table.remove_thread(trap.tid) else {
            return;
        };
        if let Some(process) = removal.process {
            log::debug!("[{}] Process {} exited: {:?}", self.ctx.id, process.pid, status);
            self.exited
                .push(process.summary(&removal.thread.files, Some(status)));
        }
    }

    fn veto(&mut self, veto: Veto, trap: &Trap) -> TraceResult {
        log::warn!(
            "[{}] {:?} checker stopped the session at tid {}: {:?}",
            self.ctx.id,
            veto.checker,
            trap.tid,
            veto.verdict.status
        );
        self.state = SessionState::Draining;
        self.backend.kill_all(&self.table);
        self.finish(TraceResult {
            status: veto.verdict.status,
            message: Some(format!("vetoed by {:?} checker", veto.checker)),
            epid: Some(trap.pid.as_raw()),
            etid: Some(trap.tid.as_raw()),
            violation: veto.verdict.violation,
            ..TraceResult::default()
        })
    }

    fn fail(&mut self, err: TraceError) -> TraceResult {
        log::warn!("[{}] Tracer failure: {}", self.ctx.id, err);
        self.state = SessionState::Draining;
        self.backend.kill_all(&self.table);
        self.finish(TraceResult {
            status: TraceStatus::TracerErr,
            message: Some(err.to_string()),
            ..TraceResult::default()
        })
    }

    fn finish(&mut self, mut result: TraceResult) -> TraceResult {
        self.pipeline.teardown();

        result.session_id = self.ctx.id.to_string();
        result.nprocess = self.table.created();
        result.exited = std::mem::take(&mut self.exited);
        result.aborted = self
            .table
            .drain()
            .into_iter()
            .map(|(process, files)| process.summary(&files, None))
            .collect();

        self.state = SessionState::Done;
        log::info!(
            "[{}] Session finished: {:?} ({} exited, {} aborted, {} created)",
            self.ctx.id,
            result.status,
            result.exited.len(),
            result.aborted.len(),
            result.nprocess
        );
        result
    }
}
