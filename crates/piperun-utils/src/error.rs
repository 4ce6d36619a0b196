//! Error types shared by the piperun crates

use std::io;
use thiserror::Error;

/// Errors surfaced by the process engine.
///
/// Every variant carries plain-string context so the error can be cloned and
/// handed to every waiter of a shared resolution (a failed start fails every
/// pending read, the start future and the exit future with the same value).
///
/// | Category | Variants |
/// |----------|----------|
/// | Spawn | `Spawn` |
/// | Wrapper protocol | `Handshake`, `HandshakeTimeout`, `WrapperLost` |
/// | Programmer errors | `PendingRead`, `ResourceAlreadyFreed`, `ResourceNotAcquired`, `InvalidWatcher` |
/// | Streams | `InvalidStream`, `StreamClosed`, `Io` |
/// | Lifecycle | `NotRunning`, `Runtime` |
///
/// End-of-stream is never an error: reads return `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Wrapper handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("Wrapper handshake timed out after {timeout_ms} ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("Lost contact with the wrapper process: {reason}")]
    WrapperLost { reason: String },

    #[error("The previous read operation must complete before read can be called again")]
    PendingRead,

    #[error("Resource has already been freed")]
    ResourceAlreadyFreed,

    #[error("Resource has not yet been acquired")]
    ResourceNotAcquired,

    #[error("Invalid watcher identifier: {id}")]
    InvalidWatcher { id: u64 },

    #[error("Invalid stream resource: {reason}")]
    InvalidStream { reason: String },

    #[error("Stream has been closed")]
    StreamClosed,

    #[error("I/O error during {operation}: {reason}")]
    Io { operation: String, reason: String },

    #[error("Process is not running")]
    NotRunning,

    #[error("No async runtime available: {reason}")]
    Runtime { reason: String },
}

impl ProcessError {
    /// Wrap an [`io::Error`] with the operation that produced it.
    #[must_use]
    pub fn io(operation: impl Into<String>, err: &io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Build a handshake failure from any displayable reason.
    #[must_use]
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// Errors caused by misuse of the API rather than by the OS or the child.
    #[cfg(test)]
    const fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::PendingRead
                | Self::ResourceAlreadyFreed
                | Self::ResourceNotAcquired
                | Self::InvalidWatcher { .. }
        )
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Wrapper executable not found: {reason}")]
    WrapperNotFound { reason: String },
}
