//! Error types for ssh-fixture.
//!
//! The taxonomy distinguishes recoverable conditions (a missing executable,
//! an exhausted port range) from conditions that abort a single backend
//! attempt. Nothing here is meant to terminate the calling test process:
//! every component-level failure is caught at the owning backend boundary
//! and converted into "this backend yields no handle".

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for ssh-fixture operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// An executable or resource could not be located. Recoverable: the
    /// caller falls back to the next candidate or backend.
    #[error("not found: {name}")]
    NotFound {
        /// The executable or resource that was searched for.
        name: String,
    },

    /// Key material could not be produced. Aborts the current backend only.
    #[error("failed to generate key material at {path}: {reason}")]
    GenerationFailed {
        /// The key path that was being generated.
        path: PathBuf,
        /// Why generation failed.
        reason: String,
    },

    /// No free port was found within the attempt bound. Aborts the current
    /// backend only.
    #[error("no unused port found after {attempts} attempts")]
    Exhausted {
        /// How many candidate ports were probed.
        attempts: u32,
    },

    /// A daemon or client process could not start.
    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        /// The command that failed to start.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A bounded wait elapsed. Treated as a probe failure, not a crash.
    #[error("timed out after {duration:?} while {context}")]
    Timeout {
        /// The timeout that elapsed.
        duration: Duration,
        /// What was being waited for.
        context: String,
    },

    /// The host OS lacks a required capability (e.g. no pseudo-terminal).
    /// Aborts only the code path that needs the capability.
    #[error("unsupported on this platform: {feature}")]
    UnsupportedPlatform {
        /// The missing capability.
        feature: String,
    },

    /// A probe ran to completion but the remote command did not succeed.
    #[error("probe of {target} failed with exit code {exit_code}")]
    ProbeFailed {
        /// Redacted URI of the probed endpoint.
        target: String,
        /// The SSH client's exit code.
        exit_code: i32,
    },

    /// The daemon backing a handle has exited; probing it cannot succeed.
    #[error("server is not running for {target}")]
    NotRunning {
        /// Redacted URI of the endpoint whose daemon is gone.
        target: String,
    },

    /// A discovered target is not reachable as an SSH endpoint.
    #[error("{target} is not an SSH endpoint: {reason}")]
    ProtocolMismatch {
        /// The target that was probed.
        target: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Every configured backend was tried and none produced a handle.
    /// Callers should treat this as "skip dependent tests", not a defect.
    #[error("no SSH backend available (tried {tried} backend(s))")]
    NoBackendAvailable {
        /// How many backends were attempted.
        tried: usize,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An I/O error occurred with additional context.
    #[error("{context}: {source}")]
    IoContext {
        /// What operation was being performed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

impl ProvisionError {
    /// Attach context to an I/O error.
    pub fn io_context(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoContext {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for a [`ProvisionError::NotFound`].
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Shorthand for a [`ProvisionError::Timeout`].
    pub fn timeout(duration: Duration, context: impl Into<String>) -> Self {
        Self::Timeout {
            duration,
            context: context.into(),
        }
    }

    /// Whether this failure should merely advance the backend chain.
    ///
    /// Everything in the taxonomy is recoverable at the selector level;
    /// this exists so call sites can assert intent rather than guess.
    #[must_use]
    pub const fn is_backend_local(&self) -> bool {
        !matches!(self, Self::NoBackendAvailable { .. })
    }
}

/// Result type alias for ssh-fixture operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
