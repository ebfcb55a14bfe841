//! # DTN Engine - Transfer Tool Orchestration
//!
//! Runs external data-transfer and benchmark programs (nuttcp, ncat, dd,
//! msrsync, fio, sysbench) as supervised sessions on a data transfer node.
//! Designed as the core behind a request layer (HTTP, CLI, automation).
//!
//! ## Overview
//!
//! The engine does not move data itself. It:
//! - Allocates and reclaims control/data ports (or local session indices)
//! - Spawns the tool for each transfer end, optionally pinned to a NUMA node
//! - Polls sessions to a terminal result with bounded waits
//! - Re-issues receivers that raced their sender ("connection refused")
//! - Cancels stalled senders and reclaims everything on `free_port`/`cleanup`
//!
//! ## Basic Usage
//!
//! ```no_run
//! use dtn_engine::{AgentConfig, Orchestrator, Role};
//! use serde_json::json;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(AgentConfig::default());
//!
//! // Sending end: the key comes back in the descriptor
//! let options = json!({}).as_object().cloned().unwrap_or_default();
//! let sender = orchestrator.create("ncat", Role::Sender, Some(Path::new("/data/src.bin")), &options)?;
//!
//! // Receiving end, usually on another host
//! let options = json!({"sessionKey": sender.session_key, "address": "10.0.0.1"})
//!     .as_object()
//!     .cloned()
//!     .unwrap_or_default();
//! orchestrator.create("ncat", Role::Receiver, Some(Path::new("/data/dst.bin")), &options)?;
//!
//! // Poll until done; StillInProgress means "ask again"
//! loop {
//!     match orchestrator.poll("ncat", Role::Receiver, sender.session_key, &options) {
//!         Ok(result) => {
//!             println!("{:?}", result.as_pair());
//!             break;
//!         }
//!         Err(e) if e.is_still_in_progress() => continue,
//!         Err(e) => return Err(e.into()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Sessions, roles, keys, descriptors and results
//! - **error**: Error types and handling
//! - **options**: Decoding of the request options map
//! - **config**: Agent configuration
//! - **port_pool**: Session key allocation
//! - **process**: External process supervision
//! - **numa**: NUMA pinning
//! - **registry**: Per-backend session tables
//! - **retry**: Receiver retry policy
//! - **polling**: Driving sessions to a terminal outcome
//! - **tool**: The transfer tool contract
//! - **tools**: Built-in tools
//! - **backend**: Per-tool context and operations
//! - **orchestrator**: Tool name -> backend table
//! - **fs_ops**: Filesystem helpers
//! - **checksums**: Checksum computation and verification

pub mod backend;
pub mod checksums;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod model;
pub mod numa;
pub mod options;
pub mod orchestrator;
pub mod polling;
pub mod port_pool;
pub mod process;
pub mod registry;
pub mod retry;
pub mod tool;
pub mod tools;

// Re-export main types and functions
pub use backend::{Backend, BackendSettings};
pub use checksums::{
    compute_checksum, compute_file_checksum, directory_checksum, verify_transfer,
    ChecksumAlgorithm, ChecksumValue,
};
pub use config::AgentConfig;
pub use error::EngineError;
pub use model::{LaunchDescriptor, Role, SessionKey, SessionState, TransferResult, TransferSession};
pub use numa::{NumaBinder, NumaScheme};
pub use options::{Compression, IoMode, TransferOptions};
pub use orchestrator::Orchestrator;
pub use port_pool::{KeyAllocator, KeyLease, PortLease, PortPool, PortRange};
pub use process::{CommandSpec, ExitInfo, OutputMode, ProcessHandle, StdinSource};
pub use retry::{RetryDecision, RetryPolicy};
pub use tool::{Keying, Launch, TransferTool};
