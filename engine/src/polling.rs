//! Driving a session to a terminal outcome.
//!
//! One poll performs a bounded wait on the session's process and then either
//! returns a `TransferResult` (releasing the session), re-issues a refused
//! receiver and waits again, or reports that the caller should ask later.
//! Re-issues and their backoff share the one wait; they never extend it.
//!
//! Callers must not poll the same key of the same role from two threads at
//! once; the second poll blocks on the session lock until the first returns.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{Role, SessionKey, SessionState, TransferResult, TransferSession};
use crate::options::TransferOptions;
use crate::process::ExitInfo;
use crate::registry::SharedSession;
use crate::retry::RetryDecision;

impl Backend {
    /// Poll a session once.
    ///
    /// The wait is `options.timeout` seconds, or the backend default.
    /// Receiver re-issues happen within it; retries already spent carry
    /// over to the next poll.
    ///
    /// # Errors
    /// - `NotRunning`: no session under this key and role
    /// - `StillInProgress`: a receiver has not exited yet
    /// - `TransferTimedOut`: a sender did not exit; it has been cancelled
    ///   and its key reclaimed
    pub fn poll_progress(
        &self,
        role: Role,
        key: SessionKey,
        options: &TransferOptions,
    ) -> Result<TransferResult, EngineError> {
        let wait = options
            .poll_wait()?
            .unwrap_or(self.settings.default_poll_wait);
        let shared = self
            .registry
            .get(role, key)
            .ok_or(EngineError::NotRunning { role, key })?;

        let mut guard = shared.lock();
        let session = &mut *guard;
        if session.state.is_released() {
            return Err(EngineError::NotRunning { role, key });
        }
        self.poll_locked(session, &shared, wait)
    }

    fn poll_locked(
        &self,
        session: &mut TransferSession,
        shared: &SharedSession,
        wait: Duration,
    ) -> Result<TransferResult, EngineError> {
        let deadline = Instant::now().checked_add(wait);
        let remaining = || deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
        loop {
            let Some(process) = session.process.as_mut() else {
                // Describes a source only; nothing to wait for
                session.state = SessionState::Completed;
                let result = TransferResult {
                    returncode: 0,
                    transferred_bytes: None,
                    retries: session.retry_count,
                    succeeded: true,
                };
                self.release(session, shared);
                return Ok(result);
            };

            let Some(exit) = process.wait_timeout(remaining())? else {
                return Err(self.wait_expired(session, shared));
            };

            match session.role {
                Role::Sender => return Ok(self.finish_sender(session, shared, exit)),
                Role::Receiver => match self.retry.decide(&exit, session.retry_count) {
                    RetryDecision::Retry { attempt } => {
                        session.retry_count = attempt;
                        session.state = SessionState::RetryPending;
                        warn!(
                            tool = self.name(),
                            key = session.key.0,
                            attempt,
                            limit = self.retry.limit,
                            "receiver connection refused, re-issuing"
                        );
                        thread::sleep(self.retry.delay(attempt).min(remaining()));
                        if let Err(e) = self.respawn_receiver(session) {
                            session.state = SessionState::Failed;
                            self.release(session, shared);
                            return Err(e);
                        }
                    }
                    RetryDecision::Exhausted => {
                        warn!(
                            tool = self.name(),
                            key = session.key.0,
                            retries = session.retry_count,
                            "receiver retries exhausted"
                        );
                        return Ok(self.finish_receiver(session, shared, exit));
                    }
                    RetryDecision::Finish => return Ok(self.finish_receiver(session, shared, exit)),
                },
            }
        }
    }

    /// The bounded wait ended with the process still running.
    fn wait_expired(&self, session: &mut TransferSession, shared: &SharedSession) -> EngineError {
        let key = session.key;
        match session.role {
            Role::Receiver => EngineError::StillInProgress { key },
            Role::Sender => {
                if let Some(process) = session.process.as_mut() {
                    process.shutdown(self.settings.kill_grace);
                }
                session.state = SessionState::Failed;
                let file = session.target_path.clone();
                self.release(session, shared);
                warn!(tool = self.name(), key = key.0, ?file, "sender stalled, cancelled");
                EngineError::TransferTimedOut { key, file }
            }
        }
    }

    fn finish_sender(
        &self,
        session: &mut TransferSession,
        shared: &SharedSession,
        exit: ExitInfo,
    ) -> TransferResult {
        let succeeded = self.tool.sender_succeeded(&exit, session.is_memory_mode());
        let result = TransferResult {
            returncode: if succeeded { 0 } else { exit.returncode() },
            transferred_bytes: None,
            retries: session.retry_count,
            succeeded,
        };
        self.complete(session, shared, &result);
        result
    }

    fn finish_receiver(
        &self,
        session: &mut TransferSession,
        shared: &SharedSession,
        exit: ExitInfo,
    ) -> TransferResult {
        let transferred_bytes = match session.target_path.as_deref() {
            Some(path) => fs_ops::transferred_size(path),
            None => self.tool.transferred_bytes(&exit.output),
        };
        let result = TransferResult {
            returncode: exit.returncode(),
            transferred_bytes,
            retries: session.retry_count,
            succeeded: exit.success(),
        };
        if !result.succeeded && !exit.output.is_empty() {
            warn!(tool = self.name(), key = session.key.0, output = %exit.output.trim(), "receiver failed");
        }
        self.complete(session, shared, &result);
        result
    }

    fn complete(&self, session: &mut TransferSession, shared: &SharedSession, result: &TransferResult) {
        session.state = if result.succeeded {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        info!(
            tool = self.name(),
            role = %session.role,
            key = session.key.0,
            returncode = result.returncode,
            bytes = ?result.transferred_bytes,
            retries = result.retries,
            "session finished"
        );
        self.release(session, shared);
    }
}
