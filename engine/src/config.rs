//! Agent configuration.
//!
//! Defaults cover everything; a JSON file can override any subset of keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::numa::NumaScheme;
use crate::port_pool::PortRange;

/// Settings shared by every backend of an orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of times a receiver is re-issued after a refused connection
    pub retry_limit: u32,

    /// Base delay before re-issuing a receiver; grows with each attempt
    pub retry_backoff_ms: u64,

    /// Poll wait used when the caller supplies none
    pub default_poll_wait_ms: u64,

    /// Time between the graceful and the forced signal on cancellation
    pub kill_grace_ms: u64,

    pub numa_scheme: NumaScheme,

    pub numa_sysfs_root: PathBuf,

    /// Where generated job files are written
    pub scratch_dir: PathBuf,

    /// Port range overrides by tool name
    pub ports: BTreeMap<String, PortRange>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            retry_limit: 4,
            retry_backoff_ms: 250,
            default_poll_wait_ms: 3000,
            kill_grace_ms: 1000,
            numa_scheme: NumaScheme::Bind,
            numa_sysfs_root: PathBuf::from("/sys/devices/system/node"),
            scratch_dir: std::env::temp_dir(),
            ports: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load a configuration file, falling back to defaults for missing keys.
    ///
    /// # Errors
    /// Returns `ReadError` if the file cannot be read and `Configuration` if
    /// it is not valid JSON for this schema.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| {
            EngineError::configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    pub fn default_poll_wait(&self) -> Duration {
        Duration::from_millis(self.default_poll_wait_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// The port range for a tool: the configured override or the tool default.
    ///
    /// An override that leaves out `data_offset` keeps the default's, so a
    /// dual-port tool stays dual-port.
    pub fn port_range(&self, tool: &str, default: PortRange) -> PortRange {
        match self.ports.get(tool) {
            Some(range) if range.data_offset.is_none() => PortRange {
                data_offset: default.data_offset,
                ..*range
            },
            Some(range) => *range,
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.retry_limit, 4);
        assert_eq!(config.default_poll_wait(), Duration::from_secs(3));
        assert_eq!(config.numa_scheme, NumaScheme::Bind);
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("agent.json");
        let mut file = std::fs::File::create(&path).expect("Failed to create config");
        file.write_all(
            br#"{"retry_limit": 2, "numa_scheme": "os-controlled",
                "ports": {"ncat": {"base": 40000, "count": 10}}}"#,
        )
        .expect("Failed to write config");
        drop(file);

        let config = AgentConfig::load(&path).expect("Failed to load config");
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.kill_grace_ms, 1000);
        assert_eq!(config.numa_scheme, NumaScheme::OsControlled);

        let fallback = PortRange::new(1, 1);
        let range = config.port_range("ncat", fallback);
        assert_eq!(range.base, 40000);
        assert_eq!(range.count, 10);
        assert_eq!(range.data_offset, None);
        assert_eq!(config.port_range("nuttcp", fallback), fallback);
    }

    #[test]
    fn test_override_keeps_default_data_offset() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"ports": {"nuttcp": {"base": 40001, "count": 50}}}"#)
                .expect("Failed to parse config");
        let default = PortRange::new(30001, 999).with_data_offset(1000);
        let range = config.port_range("nuttcp", default);
        assert_eq!(range.base, 40001);
        assert_eq!(range.count, 50);
        assert_eq!(range.data_offset, Some(1000));

        let config: AgentConfig = serde_json::from_str(
            r#"{"ports": {"nuttcp": {"base": 40001, "count": 50, "data_offset": 500}}}"#,
        )
        .expect("Failed to parse config");
        assert_eq!(config.port_range("nuttcp", default).data_offset, Some(500));
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("agent.json");
        std::fs::write(&path, "retry_limit = 2").expect("Failed to write config");
        let err = AgentConfig::load(&path).expect_err("TOML is not accepted");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_missing_file() {
        let err = AgentConfig::load(Path::new("/nonexistent/agent.json")).expect_err("missing file");
        assert!(matches!(err, EngineError::ReadError { .. }));
    }
}
