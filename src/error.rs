//! Typed error taxonomy shared by every subsystem.
//!
//! Component code returns `Error`; the CLI layer decides how to present it
//! and which exit code to use. Retry policy lives with the callers (build
//! setup retries network failures, flash transitions retry per stage), not
//! here.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error categories, used for exit-code mapping and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing file, unresolved include, schema violation, cycle.
    Config,
    /// Layout invariant, unknown behavior, arity mismatch, limit exceeded.
    Validation,
    /// Undefined variable, unknown layer reference.
    Resolution,
    /// Filesystem, network, container runtime absent.
    Io,
    /// Compiler non-zero exit.
    Build,
    /// Device not found, mount/copy/unmount failure.
    Flash,
    /// User cancellation or timeout.
    Cancelled,
    /// Invariant violation within the tool itself.
    Internal,
}

impl ErrorKind {
    /// Process exit code for this category.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Cancelled => 1,
            Self::Validation | Self::Resolution => 1,
            Self::Io | Self::Internal => 1,
            Self::Config => 3,
            Self::Build => 4,
            Self::Flash => 5,
        }
    }
}

/// Flash stage in which a failure occurred, carried by flash errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStage {
    /// Waiting for a matching device.
    Wait,
    /// Mounting the device filesystem.
    Mount,
    /// Copying the firmware image.
    Copy,
    /// Flushing buffers to the device.
    Sync,
    /// Releasing the mount point.
    Unmount,
}

impl std::fmt::Display for FlashStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Mount => write!(f, "mount"),
            Self::Copy => write!(f, "copy"),
            Self::Sync => write!(f, "sync"),
            Self::Unmount => write!(f, "unmount"),
        }
    }
}

/// The crate-wide error sum.
#[derive(Debug, Error)]
pub enum Error {
    // --- Config ---
    /// No keyboard definition matched the requested name.
    #[error("no keyboard configuration found for '{0}'")]
    ConfigNotFound(String),

    /// Include resolution revisited a file already on the stack.
    #[error("include cycle detected: {}", format_path_stack(.0))]
    IncludeCycle(Vec<PathBuf>),

    /// A merged profile failed schema validation.
    #[error("invalid profile field '{field}': {reason}")]
    SchemaError {
        /// Dotted field path that failed.
        field: String,
        /// Why it failed.
        reason: String,
    },

    /// The requested firmware version is absent from the profile.
    #[error("keyboard '{keyboard}' has no firmware '{version}'")]
    FirmwareMissing {
        /// Keyboard name.
        keyboard: String,
        /// Requested firmware version.
        version: String,
    },

    /// A compile-category operation was invoked on a keyboard-only profile.
    #[error("profile '{0}' has no firmware configuration; it can flash but not compile")]
    ProfileIncomplete(String),

    /// Generic configuration problem with context.
    #[error("configuration error: {0}")]
    Config(String),

    // --- Validation ---
    /// A binding references a behavior code the registry does not know.
    #[error("unknown behavior '{code}' at {location}")]
    UnknownBehavior {
        /// The unresolved behavior code.
        code: String,
        /// Binding location, e.g. `layers[2][13]`.
        location: String,
    },

    /// A binding's parameter count does not match the registry entry.
    #[error("behavior '{code}' at {location} expects {expected} parameter(s), got {got}")]
    ArityMismatch {
        /// Behavior code.
        code: String,
        /// Expected parameter count.
        expected: usize,
        /// Actual parameter count.
        got: usize,
        /// Binding location.
        location: String,
    },

    /// A hold-tap flavor outside the profile's allowed set.
    #[error("invalid hold-tap flavor '{got}' (allowed: {})", .allowed.join(", "))]
    InvalidFlavor {
        /// The rejected flavor.
        got: String,
        /// Flavors the profile allows.
        allowed: Vec<String>,
    },

    /// A hold-tap definition without exactly the required bindings.
    #[error("hold-tap must specify exactly {expected} bindings, got {got}")]
    HoldTapBindings {
        /// Required binding count.
        expected: usize,
        /// Actual binding count.
        got: usize,
    },

    /// A profile-defined limit was exceeded.
    #[error("{what} exceeds limit: {got} > {limit}")]
    LimitExceeded {
        /// What was counted (layers, macro parameters, ...).
        what: String,
        /// Observed count.
        got: usize,
        /// Allowed maximum.
        limit: usize,
    },

    /// Generic layout-invariant violation.
    #[error("validation failed: {0}")]
    Validation(String),

    // --- Resolution ---
    /// A `${name}` reference with no matching variable.
    #[error("undefined variable '${{{name}}}' at {location}")]
    UndefinedVariable {
        /// Variable name.
        name: String,
        /// Binding location.
        location: String,
    },

    /// A layer-switching behavior names a layer that does not exist.
    #[error("unknown layer '{0}'")]
    UnknownLayer(String),

    /// A structured edit path could not be resolved.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending dotted/bracketed path.
        path: String,
        /// Why it could not be resolved.
        reason: String,
    },

    // --- I/O ---
    /// Filesystem failure with context.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The container runtime binary is not available.
    #[error("container runtime '{0}' not found on PATH")]
    RuntimeMissing(String),

    /// JSON (de)serialization failure with context.
    #[error("{context}: {source}")]
    Json {
        /// What was being parsed or written.
        context: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// YAML (de)serialization failure with context.
    #[error("{context}: {source}")]
    Yaml {
        /// What was being parsed or written.
        context: String,
        /// Underlying serde error.
        #[source]
        source: serde_yml::Error,
    },

    // --- Build ---
    /// The compiler exited non-zero.
    #[error("build failed with exit code {exit_code}")]
    BuildFailed {
        /// Container exit code.
        exit_code: i32,
        /// Tail of the build log for diagnostics.
        log_tail: Vec<String>,
    },

    // --- Flash ---
    /// A flash-stage failure, carrying device identity and stage.
    #[error("flash {stage} failed for {device}: {reason}")]
    Flash {
        /// Stage that failed.
        stage: FlashStage,
        /// Device name or path.
        device: String,
        /// Failure detail.
        reason: String,
    },

    /// The firmware file was rejected before any device work started.
    #[error("invalid firmware file {}: {reason}", .path.display())]
    InvalidFirmware {
        /// Rejected file.
        path: PathBuf,
        /// Why.
        reason: String,
    },

    /// Bad command-line usage detected past clap (e.g. `count=0`).
    #[error("usage error: {0}")]
    Usage(String),

    // --- Control ---
    /// The operation was cancelled by the user or a deadline.
    #[error("operation cancelled")]
    Cancelled,

    /// A bug in the tool.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps an I/O error with a short description of the attempted action.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The broad category this error belongs to.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound(_)
            | Self::IncludeCycle(_)
            | Self::SchemaError { .. }
            | Self::FirmwareMissing { .. }
            | Self::ProfileIncomplete(_)
            | Self::Config(_) => ErrorKind::Config,
            Self::UnknownBehavior { .. }
            | Self::ArityMismatch { .. }
            | Self::InvalidFlavor { .. }
            | Self::HoldTapBindings { .. }
            | Self::LimitExceeded { .. }
            | Self::Validation(_) => ErrorKind::Validation,
            Self::UndefinedVariable { .. } | Self::UnknownLayer(_) | Self::InvalidPath { .. } => {
                ErrorKind::Resolution
            }
            Self::Io { .. }
            | Self::RuntimeMissing(_)
            | Self::Json { .. }
            | Self::Yaml { .. } => ErrorKind::Io,
            Self::BuildFailed { .. } => ErrorKind::Build,
            Self::Flash { .. } | Self::InvalidFirmware { .. } => ErrorKind::Flash,
            Self::Usage(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            other => other.kind().exit_code(),
        }
    }
}

fn format_path_stack(stack: &[PathBuf]) -> String {
    stack
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::ConfigNotFound("x".into()).exit_code(), 3);
        assert_eq!(Error::Usage("count must be positive".into()).exit_code(), 2);
        assert_eq!(
            Error::BuildFailed {
                exit_code: 2,
                log_tail: vec![]
            }
            .exit_code(),
            4
        );
        assert_eq!(
            Error::Flash {
                stage: FlashStage::Mount,
                device: "sda".into(),
                reason: "timeout".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(Error::Cancelled.exit_code(), 1);
        assert_eq!(Error::Validation("bad".into()).exit_code(), 1);
    }

    #[test]
    fn test_include_cycle_message() {
        let err = Error::IncludeCycle(vec![PathBuf::from("a.yaml"), PathBuf::from("b.yaml")]);
        let msg = err.to_string();
        assert!(msg.contains("a.yaml -> b.yaml"));
    }

    #[test]
    fn test_arity_mismatch_message() {
        let err = Error::ArityMismatch {
            code: "&kp".into(),
            expected: 1,
            got: 2,
            location: "layers[0][3]".into(),
        };
        assert_eq!(
            err.to_string(),
            "behavior '&kp' at layers[0][3] expects 1 parameter(s), got 2"
        );
    }
}
