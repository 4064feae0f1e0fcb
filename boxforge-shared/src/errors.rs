//! Error types shared by all BoxForge crates.
//!
//! Variants are grouped by where the failure comes from, not by the Rust type
//! that produced it. Callers mostly care about one distinction: `Config` is
//! fixable by editing the build file, everything else means the build
//! environment (registry, disk, installer) let us down.

use thiserror::Error;

/// Result alias used across BoxForge.
pub type BoxforgeResult<T> = Result<T, BoxforgeError>;

#[derive(Debug, Error)]
pub enum BoxforgeError {
    /// Build file, reference or input path is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Base image could not be resolved, pulled or parsed.
    #[error("image error: {0}")]
    Image(String),

    /// Filesystem or blob-store operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Dependency installation failed.
    #[error("install error: {0}")]
    Install(String),

    /// Operation not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BoxforgeError {
    /// True when editing the build description is the fix.
    pub fn is_user_error(&self) -> bool {
        matches!(self, BoxforgeError::Config(_))
    }
}

impl From<serde_json::Error> for BoxforgeError {
    fn from(err: serde_json::Error) -> Self {
        BoxforgeError::Internal(format!("json: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = BoxforgeError::Install("pip exited with status 1".into());
        assert_eq!(err.to_string(), "install error: pip exited with status 1");
    }

    #[test]
    fn only_config_errors_are_user_errors() {
        assert!(BoxforgeError::Config("x".into()).is_user_error());
        assert!(!BoxforgeError::Image("x".into()).is_user_error());
        assert!(!BoxforgeError::Install("x".into()).is_user_error());
    }
}
