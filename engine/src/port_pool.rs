//! Session key allocation.
//!
//! Port-keyed tools draw control ports (and, for dual-port tools, a parallel
//! data port) from a pre-sized pool. Local tools draw monotonically
//! increasing indices instead, which cost nothing and are never reused.
//!
//! The pool lock is only held across the removal or append of a value, never
//! across a process spawn.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::model::SessionKey;

/// A contiguous range of control ports, optionally paired with data ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First control port
    pub base: u16,

    /// Number of ports in the range
    pub count: u16,

    /// Data port = control port + offset (dual-port tools)
    #[serde(default)]
    pub data_offset: Option<u16>,
}

impl PortRange {
    pub const fn new(base: u16, count: u16) -> Self {
        PortRange {
            base,
            count,
            data_offset: None,
        }
    }

    pub const fn with_data_offset(mut self, offset: u16) -> Self {
        self.data_offset = Some(offset);
        self
    }

    fn control_ports(&self) -> Vec<u16> {
        (0..self.count)
            .filter_map(|i| self.base.checked_add(i))
            .collect()
    }

    fn data_ports(&self) -> Option<Vec<u16>> {
        let offset = self.data_offset?;
        Some(
            self.control_ports()
                .into_iter()
                .filter_map(|port| port.checked_add(offset))
                .collect(),
        )
    }
}

/// A control port and its data port, taken from the pool together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub control: u16,
    pub data: Option<u16>,
}

#[derive(Debug, Default)]
struct PoolState {
    seeded: bool,
    control: Vec<u16>,
    data: Vec<u16>,
}

/// Thread-safe pool of available ports.
///
/// Allocation pops from the end and release pushes back, so a port freed
/// just now is the next one handed out.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    state: Mutex<PoolState>,
}

impl PortPool {
    /// Create an unseeded pool; it is seeded on first use.
    pub fn new(range: PortRange) -> Self {
        PortPool {
            range,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Seed the pool from its range.
    ///
    /// Returns false (and changes nothing) if the pool was already seeded.
    pub fn initialize(&self) -> bool {
        let mut state = self.state.lock();
        if state.seeded {
            return false;
        }
        Self::seed(&mut state, self.range);
        true
    }

    fn seed(state: &mut PoolState, range: PortRange) {
        // Reversed so the lowest port is handed out first
        state.control = range.control_ports().into_iter().rev().collect();
        state.data = range
            .data_ports()
            .map(|ports| ports.into_iter().rev().collect())
            .unwrap_or_default();
        state.seeded = true;
    }

    /// Take one control port (and its data port) out of the pool.
    ///
    /// # Errors
    /// Returns `PoolExhausted` when every port is held.
    pub fn allocate(&self, tool: &str) -> Result<PortLease, EngineError> {
        let mut state = self.state.lock();
        if !state.seeded {
            Self::seed(&mut state, self.range);
        }

        let control = state.control.pop().ok_or_else(|| EngineError::PoolExhausted {
            tool: tool.to_string(),
        })?;
        let data = if self.range.data_offset.is_some() {
            match state.data.pop() {
                Some(port) => Some(port),
                None => {
                    state.control.push(control);
                    return Err(EngineError::PoolExhausted {
                        tool: tool.to_string(),
                    });
                }
            }
        } else {
            None
        };

        debug!(tool, control, ?data, "allocated ports");
        Ok(PortLease { control, data })
    }

    /// Return a lease to the pool.
    ///
    /// Ports already present are not added twice.
    pub fn release(&self, lease: PortLease) {
        let mut state = self.state.lock();
        if state.control.contains(&lease.control) {
            warn!(port = lease.control, "control port released twice, ignoring");
        } else {
            state.control.push(lease.control);
        }
        if let Some(data) = lease.data {
            if state.data.contains(&data) {
                warn!(port = data, "data port released twice, ignoring");
            } else {
                state.data.push(data);
            }
        }
    }

    /// Put the pool back to its full initial range.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        Self::seed(&mut state, self.range);
    }

    /// Number of free control ports.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        if state.seeded {
            state.control.len()
        } else {
            usize::from(self.range.count)
        }
    }

    /// Free control ports, sorted.
    pub fn snapshot(&self) -> Vec<u16> {
        let state = self.state.lock();
        let mut ports = if state.seeded {
            state.control.clone()
        } else {
            self.range.control_ports()
        };
        ports.sort_unstable();
        ports
    }

    /// Free data ports, sorted.
    pub fn data_snapshot(&self) -> Vec<u16> {
        let state = self.state.lock();
        let mut ports = if state.seeded {
            state.data.clone()
        } else {
            self.range.data_ports().unwrap_or_default()
        };
        ports.sort_unstable();
        ports
    }
}

/// Hands out increasing integer keys for tools without a network port.
#[derive(Debug, Default)]
pub struct IndexAllocator {
    next: AtomicU32,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// The key a session took from its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLease {
    Port(PortLease),
    Index(u32),
}

impl KeyLease {
    pub fn key(&self) -> SessionKey {
        match self {
            KeyLease::Port(lease) => SessionKey::from(lease.control),
            KeyLease::Index(index) => SessionKey(*index),
        }
    }

    pub fn data_port(&self) -> Option<u16> {
        match self {
            KeyLease::Port(lease) => lease.data,
            KeyLease::Index(_) => None,
        }
    }
}

/// Key source of one backend.
#[derive(Debug)]
pub enum KeyAllocator {
    Ports(PortPool),
    Index(IndexAllocator),
}

impl KeyAllocator {
    pub fn allocate(&self, tool: &str) -> Result<KeyLease, EngineError> {
        match self {
            KeyAllocator::Ports(pool) => pool.allocate(tool).map(KeyLease::Port),
            KeyAllocator::Index(indices) => Ok(KeyLease::Index(indices.allocate())),
        }
    }

    pub fn release(&self, lease: KeyLease) {
        match (self, lease) {
            (KeyAllocator::Ports(pool), KeyLease::Port(ports)) => pool.release(ports),
            (KeyAllocator::Index(_), KeyLease::Index(_)) => {}
            (_, lease) => warn!(?lease, "lease does not belong to this allocator"),
        }
    }

    pub fn reset(&self) {
        if let KeyAllocator::Ports(pool) = self {
            pool.reset();
        }
    }

    pub fn pool(&self) -> Option<&PortPool> {
        match self {
            KeyAllocator::Ports(pool) => Some(pool),
            KeyAllocator::Index(_) => None,
        }
    }
}
