//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: abi -> ptrace -> backend

pub mod abi;
pub mod backend;
pub mod ptrace;
