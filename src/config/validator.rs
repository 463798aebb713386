// Policy and entry validation
// Malformed input is rejected before any tracee exists, with every problem listed at once

use crate::config::policy::{AccessList, CheckerKind, Entry, Policy};
use crate::config::types::{Result, TraceError};
use std::collections::HashSet;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn into_result(self, what: &str) -> Result<ValidationResult> {
        for warning in &self.warnings {
            log::warn!("{} validation: {}", what, warning);
        }
        if self.is_valid() {
            Ok(self)
        } else {
            Err(TraceError::Config(format!(
                "{} validation failed:\n{}",
                what,
                self.errors.join("\n")
            )))
        }
    }
}

/// Validate a policy before a session is built from it
pub fn validate_policy(policy: &Policy) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if policy.nprocess == 0 {
        result.add_error("nprocess cannot be zero: the root process counts".to_string());
    }
    if policy.per_process.threads == 0 || policy.limit.threads == 0 {
        result.add_error("thread limits cannot be zero".to_string());
    }
    if policy.per_process.memory > policy.limit.memory {
        result.add_warning(format!(
            "per-process memory {} exceeds total memory {}",
            policy.per_process.memory, policy.limit.memory
        ));
    }

    validate_access_list("files", &policy.files, &mut result);
    validate_access_list("directories", &policy.directories, &mut result);
    validate_checkers(&policy.checkers, &mut result);

    if policy.calls.iter().next().is_none() {
        result.add_warning("syscall allow-set is empty; the first trap will be denied".to_string());
    }

    result.into_result("policy")
}

fn validate_access_list(name: &str, list: &AccessList, result: &mut ValidationResult) {
    for entry in list.entries() {
        if entry.path.is_empty() {
            result.add_error(format!("{}: access entry with empty path", name));
        } else if !entry.path.starts_with('/') {
            result.add_error(format!(
                "{}: access path must be absolute: {:?}",
                name, entry.path
            ));
        } else if crate::utils::path::abs(&entry.path) != entry.path && entry.path != "/" {
            result.add_warning(format!(
                "{}: access path {:?} is not normalized and may never match",
                name, entry.path
            ));
        }
    }
}

fn validate_checkers(checkers: &[CheckerKind], result: &mut ValidationResult) {
    let mut seen = HashSet::new();
    for kind in checkers {
        if !seen.insert(kind) {
            result.add_error(format!("checker {:?} registered twice", kind));
        }
    }
    if checkers.is_empty() {
        result.add_warning("no checkers registered; the tracee runs unconstrained".to_string());
    }
}

/// Validate a spawn descriptor
pub fn validate_entry(entry: &Entry) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if entry.path.as_os_str().is_empty() {
        result.add_error("executable path is empty".to_string());
    }
    if entry.argv.is_empty() {
        result.add_error("argv must contain at least the program name".to_string());
    }
    if !entry.cwd.is_absolute() {
        result.add_error(format!("cwd must be absolute path: {:?}", entry.cwd));
    }
    if let Some(ref root) = entry.root {
        if !root.is_absolute() {
            result.add_error(format!("root must be absolute path: {:?}", root));
        }
    }

    let has_nul = |s: &str| s.as_bytes().contains(&0);
    if entry.path.to_str().map_or(true, has_nul) {
        result.add_error(format!(
            "executable path must be valid UTF-8 without NUL: {:?}",
            entry.path
        ));
    }
    if entry.argv.iter().any(|a| has_nul(a)) {
        result.add_error("argv contains a NUL byte".to_string());
    }
    if entry
        .env
        .iter()
        .any(|(k, v)| has_nul(k) || has_nul(v) || k.contains('='))
    {
        result.add_error("environment contains a NUL byte or '=' in a name".to_string());
    }
    if entry.stdio.iter().any(|&fd| fd < 0) {
        result.add_error(format!("stdio descriptors must be valid: {:?}", entry.stdio));
    }

    result.into_result("entry")
}
