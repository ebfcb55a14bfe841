//! Per-tool backend context.
//!
//! A `Backend` owns everything shared by the requests for one tool: the key
//! allocator, the session registry and the runtime settings. It is built
//! once by the orchestrator and shared by reference afterwards.
//!
//! Polling lives in `polling.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{LaunchDescriptor, Role, SessionKey, SessionState, TransferSession};
use crate::numa::NumaBinder;
use crate::options::TransferOptions;
use crate::port_pool::{IndexAllocator, KeyAllocator, KeyLease, PortPool};
use crate::process::{self, CommandSpec};
use crate::registry::{SessionRegistry, SharedSession};
use crate::retry::RetryPolicy;
use crate::tool::{unsupported, Keying, Launch, TransferTool};

/// Timing and placement settings of a backend.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub default_poll_wait: Duration,
    pub kill_grace: Duration,
    pub scratch_dir: PathBuf,
}

impl BackendSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        BackendSettings {
            default_poll_wait: config.default_poll_wait(),
            kill_grace: config.kill_grace(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    pub(crate) tool: Box<dyn TransferTool>,
    pub(crate) keys: KeyAllocator,
    pub(crate) registry: SessionRegistry,
    pub(crate) numa: NumaBinder,
    pub(crate) retry: RetryPolicy,
    pub(crate) settings: BackendSettings,
}

impl Backend {
    pub fn new(tool: Box<dyn TransferTool>, config: &AgentConfig) -> Self {
        let keys = match tool.keying() {
            Keying::Ports(default) => {
                KeyAllocator::Ports(PortPool::new(config.port_range(tool.name(), default)))
            }
            Keying::Index => KeyAllocator::Index(IndexAllocator::new()),
        };
        Backend {
            tool,
            keys,
            registry: SessionRegistry::new(),
            numa: NumaBinder::new(config.numa_scheme, config.numa_sysfs_root.clone()),
            retry: RetryPolicy::new(config.retry_limit, config.retry_backoff()),
            settings: BackendSettings::from_config(config),
        }
    }

    pub fn name(&self) -> &'static str {
        self.tool.name()
    }

    pub fn tool(&self) -> &dyn TransferTool {
        self.tool.as_ref()
    }

    pub fn keys(&self) -> &KeyAllocator {
        &self.keys
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn uses_data_ports(&self) -> bool {
        self.keys
            .pool()
            .map(|pool| pool.range().data_offset.is_some())
            .unwrap_or(false)
    }

    /// Start the sending end of a transfer.
    ///
    /// `file = None` selects memory-to-memory mode. Returns as soon as the
    /// process is spawned.
    ///
    /// # Errors
    /// `Unsupported`, `Configuration`, `SourceNotFound`, `PoolExhausted` or a
    /// spawn failure. The allocated key is returned to the pool on any error.
    pub fn run_sender(
        &self,
        file: Option<&Path>,
        options: &TransferOptions,
    ) -> Result<LaunchDescriptor, EngineError> {
        if !self.tool.supports(Role::Sender) {
            return Err(unsupported(self.tool(), Role::Sender));
        }
        if file.is_none() && !self.tool.supports_memory_mode() {
            return Err(EngineError::configuration(format!(
                "{} requires a source file",
                self.name()
            )));
        }
        let size = file.map(fs_ops::file_size).transpose()?;

        let lease = self.keys.allocate(self.name())?;
        let launched = self.launch_sender(lease, file, options, size);
        if launched.is_err() {
            self.keys.release(lease);
        }
        launched
    }

    fn launch_sender(
        &self,
        lease: KeyLease,
        file: Option<&Path>,
        options: &TransferOptions,
        size: Option<u64>,
    ) -> Result<LaunchDescriptor, EngineError> {
        let key = lease.key();
        let data_port = lease.data_port();
        let launch = Launch {
            role: Role::Sender,
            key,
            data_port,
            file,
            address: None,
            peer_source: None,
            options,
            scratch_dir: &self.settings.scratch_dir,
        };
        let spec = self.tool.sender_command(&launch)?;

        let mut session = TransferSession::new(Role::Sender, key, options.clone());
        session.data_port = data_port;
        session.target_path = file.map(Path::to_path_buf);
        self.start(&mut session, spec)?;
        let pid = session.pid();
        self.register(session)?;
        // Owned by the registered session from here on
        self.attach_lease(Role::Sender, key, lease);

        info!(tool = self.name(), key = key.0, ?pid, ?size, "sender started");
        Ok(LaunchDescriptor {
            result: true,
            session_key: key,
            data_port,
            size,
            pid,
        })
    }

    /// Start the receiving end of a transfer.
    ///
    /// `file = None` selects memory-to-memory mode and requires `duration`
    /// for tools that bound their run with it. All option checks happen
    /// before anything is spawned.
    ///
    /// # Errors
    /// `Unsupported`, `Configuration`, `PoolExhausted` or a spawn failure.
    pub fn run_receiver(
        &self,
        address: Option<&str>,
        file: Option<&Path>,
        options: &TransferOptions,
    ) -> Result<LaunchDescriptor, EngineError> {
        if !self.tool.supports(Role::Receiver) {
            return Err(unsupported(self.tool(), Role::Receiver));
        }
        if file.is_none() {
            if !self.tool.supports_memory_mode() {
                return Err(EngineError::configuration(format!(
                    "{} receiver requires a destination file",
                    self.name()
                )));
            }
            if self.tool.memory_mode_needs_duration() && options.duration.is_none() {
                return Err(EngineError::configuration(
                    "duration is required when no destination file is given",
                ));
            }
        }
        if self.uses_data_ports() && options.data_port.is_none() {
            return Err(EngineError::configuration("dataPort is required"));
        }

        let (key, lease) = match options.session_key {
            Some(key) => (key, None),
            None if self.tool.receiver_needs_session_key() => {
                return Err(EngineError::configuration("sessionKey is required"));
            }
            None => {
                let lease = self.keys.allocate(self.name())?;
                (lease.key(), Some(lease))
            }
        };

        let launched = self.launch_receiver(key, address, file, options);
        match (&launched, lease) {
            (Ok(_), Some(lease)) => self.attach_lease(Role::Receiver, key, lease),
            (Err(_), Some(lease)) => self.keys.release(lease),
            (_, None) => {}
        }
        launched
    }

    fn launch_receiver(
        &self,
        key: SessionKey,
        address: Option<&str>,
        file: Option<&Path>,
        options: &TransferOptions,
    ) -> Result<LaunchDescriptor, EngineError> {
        if self.registry.get(Role::Receiver, key).is_some() {
            return Err(EngineError::configuration(format!(
                "receiver session {} is already running",
                key
            )));
        }
        let peer_source = if self.tool.receiver_needs_peer_source() {
            Some(self.peer_source(key, options)?)
        } else {
            None
        };
        if let Some(file) = file {
            fs_ops::ensure_parent_dir_exists(file)?;
        }

        let data_port = options.data_port;
        let launch = Launch {
            role: Role::Receiver,
            key,
            data_port,
            file,
            address,
            peer_source: peer_source.as_deref(),
            options,
            scratch_dir: &self.settings.scratch_dir,
        };
        let spec = self.tool.receiver_command(&launch)?;

        let mut session = TransferSession::new(Role::Receiver, key, options.clone());
        session.data_port = data_port;
        session.target_path = file.map(Path::to_path_buf);
        session.address = address.map(str::to_string);
        session.peer_source = peer_source;
        self.start(&mut session, Some(spec))?;
        let pid = session.pid();
        self.register(session)?;

        info!(tool = self.name(), key = key.0, ?pid, "receiver started");
        Ok(LaunchDescriptor {
            result: true,
            session_key: key,
            data_port,
            size: None,
            pid,
        })
    }

    /// Source file for receivers that read it directly: the `srcfile`
    /// option, else the file of the sender registered under the same key.
    fn peer_source(&self, key: SessionKey, options: &TransferOptions) -> Result<PathBuf, EngineError> {
        if let Some(srcfile) = &options.srcfile {
            return Ok(srcfile.clone());
        }
        self.registry
            .get(Role::Sender, key)
            .and_then(|sender| sender.lock().target_path.clone())
            .ok_or_else(|| {
                EngineError::configuration(format!("no source file known for session {}", key))
            })
    }

    /// Spawn the command (if any) into the session and pin it.
    fn start(&self, session: &mut TransferSession, spec: Option<CommandSpec>) -> Result<(), EngineError> {
        if let Some(spec) = spec {
            session.process = Some(self.spawn_pinned(&spec, session.options.numa_node)?);
            session.scratch_files = spec.scratch_files().to_vec();
        }
        session.state = SessionState::Running;
        Ok(())
    }

    fn spawn_pinned(
        &self,
        spec: &CommandSpec,
        numa_node: Option<u32>,
    ) -> Result<process::ProcessHandle, EngineError> {
        let handle = match process::spawn(spec) {
            Ok(handle) => handle,
            Err(e) => {
                process::remove_scratch_files(spec.scratch_files());
                return Err(e);
            }
        };
        if let Some(node) = numa_node {
            self.numa.bind(handle.pid(), node);
        }
        Ok(handle)
    }

    fn register(&self, session: TransferSession) -> Result<SharedSession, EngineError> {
        let scratch = session.scratch_files.clone();
        self.registry.insert(session).map_err(|e| {
            // The rejected session's process is killed when it is dropped
            process::remove_scratch_files(&scratch);
            e
        })
    }

    fn attach_lease(&self, role: Role, key: SessionKey, lease: KeyLease) {
        if let Some(shared) = self.registry.get(role, key) {
            let mut session = shared.lock();
            if !session.state.is_released() {
                session.lease = Some(lease);
                return;
            }
        }
        // Freed before the lease could be attached
        self.keys.release(lease);
    }

    /// Re-issue a receiver with the parameters it was first started with.
    pub(crate) fn respawn_receiver(&self, session: &mut TransferSession) -> Result<(), EngineError> {
        let launch = Launch {
            role: Role::Receiver,
            key: session.key,
            data_port: session.data_port,
            file: session.target_path.as_deref(),
            address: session.address.as_deref(),
            peer_source: session.peer_source.as_deref(),
            options: &session.options,
            scratch_dir: &self.settings.scratch_dir,
        };
        let spec = self.tool.receiver_command(&launch)?;
        let handle = self.spawn_pinned(&spec, session.options.numa_node)?;
        debug!(tool = self.name(), key = session.key.0, pid = handle.pid(), "receiver re-issued");

        for path in spec.scratch_files() {
            if !session.scratch_files.contains(path) {
                session.scratch_files.push(path.clone());
            }
        }
        session.process = Some(handle);
        session.state = SessionState::Running;
        Ok(())
    }

    /// Return a session's key and scratch files and drop it from the registry.
    ///
    /// Idempotent: a released session is left alone.
    pub(crate) fn release(&self, session: &mut TransferSession, shared: &SharedSession) {
        if session.state.is_released() {
            return;
        }
        self.registry.remove_if_same(session.role, session.key, shared);
        if let Some(lease) = session.lease.take() {
            self.keys.release(lease);
        }
        process::remove_scratch_files(&session.scratch_files);
        session.scratch_files.clear();
        session.state = SessionState::Released;
        debug!(tool = self.name(), role = %session.role, key = session.key.0, "session released");
    }

    fn terminate(&self, shared: &SharedSession) {
        let mut guard = shared.lock();
        let session = &mut *guard;
        if let Some(process) = session.process.as_mut() {
            if let Some(exit) = process.shutdown(self.settings.kill_grace) {
                debug!(
                    tool = self.name(),
                    key = session.key.0,
                    returncode = exit.returncode(),
                    "process terminated"
                );
            }
        }
        self.release(session, shared);
    }

    /// Terminate the sessions of both roles under `key` and reclaim the key.
    ///
    /// # Errors
    /// Returns `NotRunning` if no session holds the key.
    pub fn free_port(&self, key: SessionKey) -> Result<(), EngineError> {
        let mut freed = 0;
        for role in [Role::Sender, Role::Receiver] {
            if let Some(shared) = self.registry.get(role, key) {
                self.terminate(&shared);
                freed += 1;
            }
        }
        if freed == 0 {
            return Err(EngineError::NotRunning {
                role: Role::Sender,
                key,
            });
        }
        info!(tool = self.name(), key = key.0, freed, "freed session key");
        Ok(())
    }

    /// Terminate every session and reset the key pool.
    ///
    /// Never fails; returns the number of sessions terminated.
    pub fn cleanup(&self) -> usize {
        let sessions = self.registry.drain();
        let count = sessions.len();
        for shared in &sessions {
            self.terminate(shared);
        }
        self.keys.reset();
        if count > 0 {
            info!(tool = self.name(), count, "cleaned up sessions");
        } else {
            debug!(tool = self.name(), "nothing to clean up");
        }
        count
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        let remaining = self.registry.len();
        if remaining > 0 {
            warn!(tool = self.name(), remaining, "backend dropped with live sessions");
            self.cleanup();
        }
    }
}
