//! Per-backend session registry.
//!
//! Senders and receivers live in separate tables: a streaming copy runs its
//! sender and receiver on the same host under the same key.
//!
//! Lock order: a session's own lock may be held while calling into the
//! registry, never the other way round.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::model::{Role, SessionKey, TransferSession};

/// A registered session, shared between the registry and its current poller.
pub type SharedSession = Arc<Mutex<TransferSession>>;

#[derive(Debug, Default)]
struct Tables {
    senders: HashMap<SessionKey, SharedSession>,
    receivers: HashMap<SessionKey, SharedSession>,
}

impl Tables {
    fn for_role(&mut self, role: Role) -> &mut HashMap<SessionKey, SharedSession> {
        match role {
            Role::Sender => &mut self.senders,
            Role::Receiver => &mut self.receivers,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    tables: Mutex<Tables>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its role and key.
    ///
    /// # Errors
    /// Returns `Configuration` if a session already holds that key.
    pub fn insert(&self, session: TransferSession) -> Result<SharedSession, EngineError> {
        let (role, key) = (session.role, session.key);
        let mut tables = self.tables.lock();
        let table = tables.for_role(role);
        if table.contains_key(&key) {
            return Err(EngineError::configuration(format!(
                "{} session {} is already running",
                role, key
            )));
        }
        let shared = Arc::new(Mutex::new(session));
        table.insert(key, Arc::clone(&shared));
        Ok(shared)
    }

    pub fn get(&self, role: Role, key: SessionKey) -> Option<SharedSession> {
        self.tables.lock().for_role(role).get(&key).cloned()
    }

    /// Remove the entry for `key` only if it is still `session`.
    pub fn remove_if_same(&self, role: Role, key: SessionKey, session: &SharedSession) -> bool {
        let mut tables = self.tables.lock();
        let table = tables.for_role(role);
        match table.get(&key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                table.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Remove and return every session, senders first.
    pub fn drain(&self) -> Vec<SharedSession> {
        let mut tables = self.tables.lock();
        let mut sessions: Vec<_> = tables.senders.drain().map(|(_, s)| s).collect();
        sessions.extend(tables.receivers.drain().map(|(_, s)| s));
        sessions
    }

    pub fn len(&self) -> usize {
        let tables = self.tables.lock();
        tables.senders.len() + tables.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys registered for a role, sorted.
    pub fn keys(&self, role: Role) -> Vec<SessionKey> {
        let mut keys: Vec<_> = self.tables.lock().for_role(role).keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}
