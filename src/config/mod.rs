//! Configuration and policy
//!
//! Policy and spawn descriptor types, the result taxonomy, and validation.

pub mod policy;
pub mod types;
pub mod validator;
