//! Core data model for transfer sessions.
//!
//! This module defines the main data structures shared by every backend:
//! - TransferSession: one in-flight invocation of an external tool
//! - Role, SessionKey, SessionState: identifiers and lifecycle
//! - LaunchDescriptor, TransferResult: what callers get back

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::options::TransferOptions;
use crate::port_pool::KeyLease;
use crate::process::ProcessHandle;

/// Which end of a transfer a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(format!(
                "role has to be either sender or receiver, got '{}'",
                other
            )),
        }
    }
}

/// Handle identifying one session within a backend.
///
/// For port-keyed tools this is the control port; for local tools it is an
/// index handed out by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub u32);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for SessionKey {
    fn from(port: u16) -> Self {
        SessionKey(u32::from(port))
    }
}

/// Lifecycle of a session.
///
/// Created -> Running -> {Completed, Failed} -> Released. A refused
/// receiver goes Running -> RetryPending and back to Running when it is
/// re-issued, or to Failed if the re-issue cannot start. Released is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    RetryPending,
    Completed,
    Failed,
    Released,
}

impl SessionState {
    /// Returns true once the session has left the registry for good.
    pub fn is_released(&self) -> bool {
        matches!(self, SessionState::Released)
    }
}

/// One in-flight backend invocation.
///
/// Owned exclusively by its backend's registry. Everything needed to
/// re-issue a receiver on retry is kept here.
#[derive(Debug)]
pub struct TransferSession {
    /// Unique identifier, used to correlate log lines
    pub id: Uuid,

    pub role: Role,

    pub key: SessionKey,

    /// The key this session took from the backend's allocator, if it owns one.
    /// Receivers reuse the key issued by their sender and own nothing.
    pub lease: Option<KeyLease>,

    pub data_port: Option<u16>,

    /// `None` for sessions that only describe a source (dd / fio senders).
    pub process: Option<ProcessHandle>,

    /// Source file for senders, destination for receivers
    pub target_path: Option<PathBuf>,

    /// Source resolved for receivers that read the file themselves (dd)
    pub peer_source: Option<PathBuf>,

    pub address: Option<String>,

    pub options: TransferOptions,

    pub started_at: DateTime<Utc>,

    pub retry_count: u32,

    pub state: SessionState,

    /// Generated files removed when the session is released
    pub scratch_files: Vec<PathBuf>,
}

impl TransferSession {
    /// Create a session in the `Created` state.
    pub fn new(role: Role, key: SessionKey, options: TransferOptions) -> Self {
        TransferSession {
            id: Uuid::new_v4(),
            role,
            key,
            lease: None,
            data_port: None,
            process: None,
            target_path: None,
            peer_source: None,
            address: None,
            options,
            started_at: Utc::now(),
            retry_count: 0,
            state: SessionState::Created,
            scratch_files: Vec::new(),
        }
    }

    /// Memory-to-memory sessions have no file at this endpoint.
    pub fn is_memory_mode(&self) -> bool {
        self.target_path.is_none()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }
}

/// Returned by `run_sender` / `run_receiver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchDescriptor {
    pub result: bool,

    pub session_key: SessionKey,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,

    /// Size of the source file, for senders given a file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Terminal outcome of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    /// Exit code of the tool. A sender whose time-bound wrapper fired
    /// reports 0 here.
    pub returncode: i32,

    /// Destination size, or a count parsed from tool output in
    /// memory-to-memory mode. `None` when neither is available.
    pub transferred_bytes: Option<u64>,

    /// How many times the receiver was re-issued
    pub retries: u32,

    pub succeeded: bool,
}

impl TransferResult {
    /// The `(returncode, byteCount)` pair exposed to the request layer.
    pub fn as_pair(&self) -> (i32, Option<u64>) {
        (self.returncode, self.transferred_bytes)
    }
}
