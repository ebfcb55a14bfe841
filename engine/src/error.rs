//! Error types for the transfer engine.
//!
//! The primary error type is `EngineError`. Besides genuine failures it also
//! carries the two polling signals of the engine: `StillInProgress` (ask
//! again later) and `TransferTimedOut` (a sender stalled and was cancelled).
//!
//! Unclassified process failures are NOT errors: a non-zero exit is surfaced
//! to the caller as a `TransferResult` so it can be inspected.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{Role, SessionKey};

/// Errors raised by backends and the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required option is missing or an option value is invalid.
    ///
    /// Always raised before any process is spawned.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// No session is registered under this key for the given role.
    #[error("{role} session {key} is not running")]
    NotRunning { role: Role, key: SessionKey },

    /// The receiver has not finished yet; poll again later.
    #[error("session {key} is still in progress")]
    StillInProgress { key: SessionKey },

    /// The sender did not exit within the poll wait and was cancelled.
    #[error("sender timed out on session {key}")]
    TransferTimedOut {
        key: SessionKey,
        file: Option<PathBuf>,
    },

    /// The tool has no implementation for this role.
    #[error("{tool} does not support the {role} role")]
    Unsupported { tool: String, role: Role },

    /// No backend is registered under this name.
    #[error("transfer tool {name} not found")]
    UnknownTool { name: String },

    /// Every session key of the backend is currently held.
    #[error("no free session keys left for {tool}")]
    PoolExhausted { tool: String },

    /// Source file does not exist
    #[error("source file not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// The external program could not be started.
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on a spawned process failed.
    #[error("failed to wait on process {pid}: {source}")]
    WaitFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Failed to read from a file
    #[error("failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a file or create a directory
    #[error("failed to write: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    /// Shorthand for a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
        }
    }

    /// True for errors caused by the request itself rather than by a process.
    ///
    /// `NotRunning` belongs here: polling or freeing an unknown key is a
    /// caller mistake.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::NotRunning { .. } | Self::UnknownTool { .. }
        )
    }

    /// True when the caller should simply poll again.
    pub fn is_still_in_progress(&self) -> bool {
        matches!(self, Self::StillInProgress { .. })
    }

    /// The stalled source file carried by a sender timeout, if any.
    pub fn timed_out_file(&self) -> Option<&PathBuf> {
        match self {
            Self::TransferTimedOut { file, .. } => file.as_ref(),
            _ => None,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SpawnFailed { source, .. }
            | Self::WaitFailed { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
