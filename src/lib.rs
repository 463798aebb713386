//! tracebox: ptrace-based sandboxed execution tracer
//! Runs an untrusted program under kernel process tracing, enforces syscall,
//! path, task and resource policy on every stop, and reports one verdict
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::abi`]: Per-architecture/per-compat-mode syscall decoding into one canonical number space
//! - [`kernel::ptrace`]: ptrace backend (spawn, wait decoding, clone correlation, memory peek/poke)
//! - [`kernel::backend`]: The backend trait the session is written against
//!
//! ## Core ([`core`])
//! - [`core::handles`]: Copy-on-write descriptor tables and working directories
//! - [`core::process`]: Process/thread tree keyed by pid/tid
//! - [`core::trap`]: Normalized stop events
//! - [`core::session`]: The trace-inspect-decide loop
//!
//! ## Policy Checkers ([`checker`])
//! - [`checker::syscall`]: Syscall allow-set
//! - [`checker::file`]: Path access lists, descriptor tracking, descriptor ceiling
//! - [`checker::fork`]: Clone placement and task quotas
//! - [`checker::io`]: Cumulative read/write ceilings
//! - [`checker::resource`]: Memory and CPU-time ceilings
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::policy`]: Policy, limits, access lists, spawn descriptor
//! - [`config::types`]: Result taxonomy and the crate error type
//! - [`config::validator`]: Rejects malformed policy/entry before a tracee exists
//!
//! ## Utilities ([`utils`])
//! - [`utils::path`]: Lexical path normalization
//! - [`utils::fd_closure`]: FD closure hardening before exec
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - Verdicts come from observed stops, wait status and rusage
//! 2. **No orphans** - Every live tracee is killed before a session reports
//! 3. **Violations are values** - A veto is a `TraceResult`, never an `Err`
//! 4. **Minimal unsafe** - Thin wrappers with explicit SAFETY comments, all under [`kernel`] and [`utils`]

// Kernel Primitives
pub mod kernel;

// Tracer core
pub mod core;

// Policy checkers
pub mod checker;

// Configuration & Policy
pub mod config;

// Utilities
pub mod utils;

// Re-export commonly used types for convenience
pub use config::policy::{Entry, Limit, Policy, TriggerMode};
pub use config::types::*;
pub use crate::core::session::{SessionContext, SessionState, TraceSession};
pub use kernel::ptrace::PtraceBackend;
