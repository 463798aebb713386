//! Tracer core.
//!
//! Core owns the traced process model, the copy-on-write resource handles
//! shared between its threads, and the session loop that drives the checker
//! pipeline. Kernel access goes through [`crate::kernel::backend::TraceBackend`].

pub mod handles;
pub mod process;
pub mod session;
pub mod trap;
