//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use dtn_engine::process::{CommandSpec, OutputMode};
use dtn_engine::tool::{Keying, Launch, TransferTool};
use dtn_engine::{AgentConfig, EngineError, PortRange, TransferOptions};

/// Ports handed out by the scripted port-keyed tool. Nothing binds them.
pub const SCRIPTED_PORTS: PortRange = PortRange::new(47001, 4);

/// A tool whose ends are plain `sh` scripts.
///
/// Each script gets the endpoint file (or an empty string) as `$1` and the
/// session key as `$2`. Output is captured so retry classification sees it.
/// A receiver with a `receiver_consumer` runs as `receiver | consumer`.
#[derive(Debug, Clone)]
pub struct ScriptedTool {
    pub keying: Keying,
    pub sender: Option<String>,
    pub receiver: String,
    pub receiver_consumer: Option<String>,
    pub memory_mode: bool,
}

impl ScriptedTool {
    pub fn ports(sender: &str, receiver: &str) -> Self {
        ScriptedTool {
            keying: Keying::Ports(SCRIPTED_PORTS),
            sender: Some(sender.to_string()),
            receiver: receiver.to_string(),
            receiver_consumer: None,
            memory_mode: false,
        }
    }

    pub fn indexed(sender: Option<&str>, receiver: &str) -> Self {
        ScriptedTool {
            keying: Keying::Index,
            sender: sender.map(str::to_string),
            receiver: receiver.to_string(),
            receiver_consumer: None,
            memory_mode: false,
        }
    }

    pub fn piped_into(mut self, consumer: &str) -> Self {
        self.receiver_consumer = Some(consumer.to_string());
        self
    }

    pub fn with_memory_mode(mut self) -> Self {
        self.memory_mode = true;
        self
    }

    fn command(spec: CommandSpec, launch: &Launch<'_>) -> CommandSpec {
        let file = launch
            .file
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        spec.arg(file)
            .arg(launch.key.to_string())
            .stdout(OutputMode::Capture)
            .stderr(OutputMode::Capture)
    }
}

impl TransferTool for ScriptedTool {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn keying(&self) -> Keying {
        self.keying
    }

    fn supports_memory_mode(&self) -> bool {
        self.memory_mode
    }

    fn sender_command(&self, launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        Ok(self
            .sender
            .as_deref()
            .map(|script| Self::command(CommandSpec::shell(script), launch)))
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let spec = match self.receiver_consumer.as_deref() {
            Some(consumer) => CommandSpec::pipe(&self.receiver, consumer),
            None => CommandSpec::shell(self.receiver.as_str()),
        };
        Ok(Self::command(spec, launch))
    }
}

/// Fast retries and no pinning, so tests stay quick on any host.
pub fn test_config(scratch_dir: &Path) -> AgentConfig {
    AgentConfig {
        retry_backoff_ms: 10,
        kill_grace_ms: 200,
        numa_scheme: dtn_engine::NumaScheme::OsControlled,
        scratch_dir: scratch_dir.to_path_buf(),
        ..AgentConfig::default()
    }
}

/// Options with a poll wait of `secs` seconds.
pub fn waiting(secs: f64) -> TransferOptions {
    TransferOptions {
        timeout: Some(secs),
        ..TransferOptions::default()
    }
}

pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Whether a program can be found on `PATH`.
pub fn have_program(program: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg("command -v \"$1\" >/dev/null 2>&1")
        .arg("sh")
        .arg(program)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
