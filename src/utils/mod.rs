//! Utilities
//!
//! Lexical path handling for tracee paths and descriptor hygiene for the
//! pre-exec child.

pub mod fd_closure;
pub mod path;
