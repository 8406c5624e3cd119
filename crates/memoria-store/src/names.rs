//! Branch and container name validation.
//!
//! Valid branch names:
//! - Must be non-empty
//! - Must not contain whitespace or control characters
//! - Must not contain `..` or consecutive slashes
//! - Must not start or end with `/`

use crate::error::{StoreError, StoreResult};

fn invalid(name: &str, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Validate a branch name, returning `Ok(())` if valid.
pub fn validate_branch_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(invalid(name, "branch name must not be empty"));
    }
    if let Some(ch) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid(name, format!("contains forbidden character: {ch:?}")));
    }
    if name.contains("..") {
        return Err(invalid(name, "must not contain '..'"));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(invalid(name, "must not start or end with '/'"));
    }
    if name.contains("//") {
        return Err(invalid(name, "must not contain consecutive slashes '//'"));
    }
    Ok(())
}

/// Validate a root-directory entry name. Any non-empty string without
/// control characters is accepted.
pub fn validate_container_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(invalid(name, "container name must not be empty"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid(name, "must not contain control characters"));
    }
    Ok(())
}
