//! Decoding of the request options map.
//!
//! The request layer hands the engine an already-decoded JSON object. This
//! module turns it into `TransferOptions` and rejects anything that could end
//! up on a command line unchecked.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::model::SessionKey;

/// Options recognised by the backends.
///
/// Unknown keys are ignored; each backend reads the subset it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferOptions {
    /// Key issued by the paired sender
    #[serde(alias = "cport", alias = "session_key")]
    pub session_key: Option<SessionKey>,

    /// Data port issued by the paired sender (dual-port tools only)
    #[serde(alias = "dport", alias = "data_port")]
    pub data_port: Option<u16>,

    pub direct: bool,

    pub zerocopy: bool,

    pub blocksize: u64,

    pub compression: Option<Compression>,

    /// Seconds; bounds a memory-to-memory run
    pub duration: Option<u64>,

    #[serde(alias = "numa_node")]
    pub numa_node: Option<u32>,

    /// Poll wait in seconds
    pub timeout: Option<f64>,

    /// Source file for receivers that read it directly
    pub srcfile: Option<PathBuf>,

    /// Parallel workers for the archive sync tool
    pub parallel: u32,

    pub iomode: IoMode,

    /// IO stress schedule: start offset (s) -> rate
    pub sequence: Option<BTreeMap<String, String>>,

    /// CPU stress schedule: start offset (s) -> thread count
    pub cpu: Option<BTreeMap<String, String>>,

    /// File size for the IO stress schedule, e.g. "10g"
    pub size: Option<String>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            session_key: None,
            data_port: None,
            direct: true,
            zerocopy: true,
            blocksize: 8192,
            compression: None,
            duration: None,
            numa_node: None,
            timeout: None,
            srcfile: None,
            parallel: 1,
            iomode: IoMode::Write,
            sequence: None,
            cpu: None,
            size: None,
        }
    }
}

impl TransferOptions {
    /// Decode options from a request map.
    ///
    /// # Errors
    /// Returns `Configuration` when a value has the wrong type or is not in
    /// an allow-list (e.g. an unknown compression).
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, EngineError> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| EngineError::configuration(format!("invalid options: {}", e)))
    }

    /// The caller-supplied poll wait, if any.
    ///
    /// Values too large for a `Duration` saturate to `Duration::MAX`.
    pub fn poll_wait(&self) -> Result<Option<Duration>, EngineError> {
        match self.timeout {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)))
            }
            Some(secs) => Err(EngineError::configuration(format!(
                "timeout must be a non-negative number of seconds, got {}",
                secs
            ))),
        }
    }
}

/// Allow-listed stream compressors.
///
/// Only these names can reach a shell pipeline; any other string fails to
/// decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Zstd,
    Lz4,
}

impl Compression {
    /// Shell fragment compressing stdin to stdout.
    pub fn compress_command(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip -c",
            Compression::Zstd => "zstd -q -c",
            Compression::Lz4 => "lz4 -q -c",
        }
    }

    /// Shell fragment decompressing stdin to stdout.
    pub fn decompress_command(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip -d -c",
            Compression::Zstd => "zstd -q -d -c",
            Compression::Lz4 => "lz4 -q -d -c",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    #[serde(alias = "Read", alias = "READ")]
    Read,
    #[serde(alias = "Write", alias = "WRITE")]
    Write,
}

impl IoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoMode::Read => "read",
            IoMode::Write => "write",
        }
    }
}

/// One step of a stress schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleStep {
    /// Seconds since the schedule started
    pub start: u64,
    pub duration: u64,
    pub value: String,
}

/// Turn an offset -> value map into ordered steps.
///
/// Offsets must be integers; each step lasts until the next offset, so the
/// last entry only marks the end of the schedule. Values must be plain
/// alphanumeric tokens.
pub fn schedule_steps(schedule: &BTreeMap<String, String>) -> Result<Vec<ScheduleStep>, EngineError> {
    let mut offsets = Vec::with_capacity(schedule.len());
    for (offset, value) in schedule {
        let start: u64 = offset
            .trim()
            .parse()
            .map_err(|_| EngineError::configuration("sequence has to be numbers"))?;
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            return Err(EngineError::configuration(format!(
                "invalid schedule value '{}' at offset {}",
                value, offset
            )));
        }
        offsets.push((start, value.clone()));
    }
    offsets.sort_by_key(|(start, _)| *start);

    Ok(offsets
        .windows(2)
        .map(|pair| ScheduleStep {
            start: pair[0].0,
            duration: pair[1].0 - pair[0].0,
            value: pair[0].1.clone(),
        })
        .collect())
}
