//! NUMA pinning of spawned transfer processes.
//!
//! Pinning is best-effort. A missing topology, an unknown node or a failed
//! `sched_setaffinity` call is logged and the transfer carries on unpinned.
//!
//! # Platform Support
//!
//! - **Linux**: node CPU sets come from sysfs, pinning uses `sched_setaffinity`
//! - **Other**: every bind is a logged no-op

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Who decides where transfer processes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumaScheme {
    /// Pin to the CPUs of the requested node
    #[default]
    Bind,
    /// Leave placement to the kernel scheduler
    OsControlled,
}

/// Maximum CPU index representable in a `cpu_set_t`.
#[cfg(target_os = "linux")]
const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

/// Pins processes to the CPUs of a NUMA node.
#[derive(Debug, Clone)]
pub struct NumaBinder {
    scheme: NumaScheme,
    sysfs_root: PathBuf,
}

impl NumaBinder {
    pub fn new(scheme: NumaScheme, sysfs_root: impl Into<PathBuf>) -> Self {
        NumaBinder {
            scheme,
            sysfs_root: sysfs_root.into(),
        }
    }

    pub fn scheme(&self) -> NumaScheme {
        self.scheme
    }

    /// CPUs belonging to `node`, read from `<sysfs>/node<N>/cpulist`.
    pub fn node_cpus(&self, node: u32) -> io::Result<Vec<usize>> {
        let path = self.sysfs_root.join(format!("node{}", node)).join("cpulist");
        let content = std::fs::read_to_string(&path)?;
        parse_cpu_list(&content)
    }

    /// Pin `pid` to the CPUs of `node`.
    ///
    /// Returns the CPU list that was applied, or `None` when nothing was
    /// pinned. Never fails.
    pub fn bind(&self, pid: u32, node: u32) -> Option<Vec<usize>> {
        if self.scheme == NumaScheme::OsControlled {
            debug!(pid, node, "numa scheme is os-controlled, not pinning");
            return None;
        }

        let cpus = match self.node_cpus(node) {
            Ok(cpus) if !cpus.is_empty() => cpus,
            Ok(_) => {
                warn!(pid, node, "numa node has no cpus, not pinning");
                return None;
            }
            Err(e) => {
                warn!(pid, node, root = %self.sysfs_root.display(), error = %e, "numa topology unavailable");
                return None;
            }
        };

        match set_process_affinity(pid, &cpus) {
            Ok(()) => {
                debug!(pid, node, ?cpus, "pinned process to numa node");
                Some(cpus)
            }
            Err(e) => {
                warn!(pid, node, error = %e, "failed to pin process");
                None
            }
        }
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> io::Result<Vec<usize>> {
    let invalid = |part: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid cpu list entry '{}'", part),
        )
    };

    let mut cpus = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.parse().map_err(|_| invalid(part))?;
                let end: usize = end.parse().map_err(|_| invalid(part))?;
                if end < start {
                    return Err(invalid(part));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.parse().map_err(|_| invalid(part))?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

#[cfg(target_os = "linux")]
fn set_process_affinity(pid: u32, cpus: &[usize]) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if let Some(cpu) = cpus.iter().find(|cpu| **cpu >= CPU_SET_CAPACITY) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu {} exceeds cpu set capacity ({})", cpu, CPU_SET_CAPACITY),
        ));
    }

    // SAFETY:
    // - cpu_set_t is valid when zeroed
    // - every cpu index was checked against CPU_SET_CAPACITY
    // - sched_setaffinity reports failure through errno
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in cpus {
            libc::CPU_SET(*cpu, &mut set);
        }
        if libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_process_affinity(_pid: u32, _cpus: &[usize]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process affinity is not supported on this platform",
    ))
}
