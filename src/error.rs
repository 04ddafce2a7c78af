//! Error types for buildsmith
//!
//! All modules use `SmithResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for buildsmith operations
pub type SmithResult<T> = Result<T, SmithError>;

/// All errors that can occur in buildsmith
#[derive(Error, Debug)]
pub enum SmithError {
    // Validation errors
    #[error("bad uid/gid {0} (must fit in a u32, or -1 to disable)")]
    UidOutOfRange(i64),

    #[error("missing required information: OS or arch")]
    IncompletePlatform,

    #[error("nothing to deploy")]
    NothingToDeploy,

    #[error("too many packages to deploy (core alone, or core plus one plugin)")]
    TooManyPackages,

    #[error("core package missing from build environment")]
    NoCorePackage,

    // Provisioning errors
    #[error("copying {src} to {dest}: {source}")]
    Copy {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Subprocess errors
    #[error("failed to start {command}: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command failed: {command} (in {workdir}, exit status {status})")]
    CommandFailed {
        command: String,
        workdir: String,
        status: i32,
    },

    // Verification / build errors (wrap the failing step for the log)
    #[error("{step}: {source}")]
    CheckFailed {
        step: String,
        #[source]
        source: Box<SmithError>,
    },

    #[error("building core: {source}")]
    Build {
        #[source]
        source: Box<SmithError>,
    },

    #[error("error compressing: {0}")]
    Archive(String),

    // Integrity errors: the master cache may be inconsistent
    #[error("{context}; additionally, error restoring master cache: {restore}")]
    RestoreFailed { context: String, restore: String },

    #[error("snapshotting master cache: {0}")]
    Snapshot(String),

    // Signing errors
    #[error("no signing key loaded")]
    NoSigningKey,

    #[error("signing error: {0}")]
    Signing(String),

    // IO errors
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl SmithError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a failing verification step (vet, test, cross-build) with its name
    pub fn check(step: impl Into<String>, source: SmithError) -> Self {
        Self::CheckFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error is the caller's fault (HTTP 400) rather than ours.
    ///
    /// Validation, provisioning, verification, and build failures map to 400;
    /// everything else (IO, signing, integrity) is a 500.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UidOutOfRange(_)
                | Self::IncompletePlatform
                | Self::NothingToDeploy
                | Self::TooManyPackages
                | Self::NoCorePackage
                | Self::Copy { .. }
                | Self::CommandSpawn { .. }
                | Self::CommandFailed { .. }
                | Self::CheckFailed { .. }
                | Self::Build { .. }
                | Self::Archive(_)
        )
    }

    /// Whether the master cache may have been left inconsistent
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::RestoreFailed { .. } | Self::Snapshot(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SmithError::CommandFailed {
            command: "go vet ./...".to_string(),
            workdir: "/tmp/ws".to_string(),
            status: 2,
        };
        assert!(err.to_string().contains("go vet ./..."));
        assert!(err.to_string().contains("exit status 2"));
    }

    #[test]
    fn check_wraps_step_name() {
        let inner = SmithError::CommandFailed {
            command: "go test -race ./...".to_string(),
            workdir: "/tmp/ws".to_string(),
            status: 1,
        };
        let err = SmithError::check("go test plugin example.com/x", inner);
        assert!(err.to_string().starts_with("go test plugin example.com/x"));
    }

    #[test]
    fn client_error_classification() {
        assert!(SmithError::IncompletePlatform.is_client_error());
        assert!(SmithError::NothingToDeploy.is_client_error());
        assert!(!SmithError::NoSigningKey.is_client_error());
        assert!(
            !SmithError::io(
                "reading key",
                std::io::Error::new(std::io::ErrorKind::Other, "x")
            )
            .is_client_error()
        );
    }

    #[test]
    fn integrity_classification() {
        let err = SmithError::RestoreFailed {
            context: "go test core with plugin: exit status 1".to_string(),
            restore: "rename failed".to_string(),
        };
        assert!(err.is_integrity());
        assert!(!SmithError::NothingToDeploy.is_integrity());
    }
}
