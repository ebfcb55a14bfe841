//! The contract every transfer tool implements.
//!
//! A tool only knows how to turn a launch request into a command and how to
//! read the outcome of that command. Key allocation, process supervision,
//! registration and polling are shared and live in `Backend`.

use std::fmt;
use std::path::Path;

use crate::error::EngineError;
use crate::model::{Role, SessionKey};
use crate::options::TransferOptions;
use crate::port_pool::PortRange;
use crate::process::{CommandSpec, ExitInfo, TIMEOUT_EXIT_CODE};

/// How a tool's sessions are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keying {
    /// Network tools: the key is a control port from this default range
    Ports(PortRange),
    /// Local tools: the key is an index that maps to no OS resource
    Index,
}

/// Parameters of one invocation, handed to the command builders.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub role: Role,
    pub key: SessionKey,
    pub data_port: Option<u16>,

    /// Source for senders, destination for receivers; `None` in
    /// memory-to-memory mode
    pub file: Option<&'a Path>,

    /// Peer host for network receivers, source directory for archive sync
    pub address: Option<&'a str>,

    /// Source a receiver reads directly (streaming copy)
    pub peer_source: Option<&'a Path>,

    pub options: &'a TransferOptions,

    /// Where generated job files go
    pub scratch_dir: &'a Path,
}

impl<'a> Launch<'a> {
    /// The control port, for port-keyed tools.
    pub fn port(&self) -> Result<u16, EngineError> {
        u16::try_from(self.key.0).map_err(|_| {
            EngineError::configuration(format!("session key {} is not a port", self.key))
        })
    }

    pub fn require_data_port(&self) -> Result<u16, EngineError> {
        self.data_port
            .ok_or_else(|| EngineError::configuration("dataPort is required"))
    }

    pub fn require_address(&self) -> Result<&'a str, EngineError> {
        self.address
            .filter(|address| !address.is_empty())
            .ok_or_else(|| EngineError::configuration("address is required"))
    }

    pub fn require_file(&self) -> Result<&'a Path, EngineError> {
        self.file.ok_or_else(|| match self.role {
            Role::Sender => EngineError::configuration("a source file is required"),
            Role::Receiver => EngineError::configuration("a destination file is required"),
        })
    }

    pub fn require_duration(&self) -> Result<u64, EngineError> {
        self.options.duration.ok_or_else(|| {
            EngineError::configuration("duration is required for memory-to-memory transfers")
        })
    }
}

/// A concrete external transfer or benchmark program.
pub trait TransferTool: Send + Sync + fmt::Debug {
    /// Name used to select the tool, e.g. "nuttcp".
    fn name(&self) -> &'static str;

    fn keying(&self) -> Keying;

    fn supports(&self, _role: Role) -> bool {
        true
    }

    /// Whether the tool can run without a file at this endpoint.
    fn supports_memory_mode(&self) -> bool {
        false
    }

    /// Whether a receiver without a destination file needs `duration`.
    fn memory_mode_needs_duration(&self) -> bool {
        true
    }

    /// Whether a receiver must be given the key issued by its sender.
    fn receiver_needs_session_key(&self) -> bool {
        matches!(self.keying(), Keying::Ports(_))
    }

    /// Whether the receiver reads the source file itself.
    fn receiver_needs_peer_source(&self) -> bool {
        false
    }

    /// Command for the sending end, or `None` for tools whose sender only
    /// describes the source.
    fn sender_command(&self, launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError>;

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError>;

    /// Whether a finished sender succeeded.
    ///
    /// The exit code of the time-bound wrapper is the normal end of a
    /// memory-to-memory sender.
    fn sender_succeeded(&self, exit: &ExitInfo, memory_mode: bool) -> bool {
        exit.success() || (memory_mode && exit.code == Some(TIMEOUT_EXIT_CODE))
    }

    /// Byte count parsed from captured output, when there is no file to
    /// measure.
    fn transferred_bytes(&self, _output: &str) -> Option<u64> {
        None
    }
}

pub(crate) fn unsupported(tool: &dyn TransferTool, role: Role) -> EngineError {
    EngineError::Unsupported {
        tool: tool.name().to_string(),
        role,
    }
}

/// Path as a command-line argument.
pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
