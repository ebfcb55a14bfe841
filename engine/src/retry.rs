//! Bounded re-issue of receivers after transient connection failures.
//!
//! A receiver started before its sender is listening exits with a refused
//! connection. That exit is retried up to `limit` times with a linearly
//! growing delay; after that the poll returns a terminal result.

use std::time::Duration;

use crate::process::ExitInfo;

/// Output fragments that mark an exit as transient (matched lowercase).
const TRANSIENT_SIGNATURES: &[&str] = &["connection refused"];

/// How a finished receiver exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Clean,
    TransientConnection,
    Failed,
}

/// What the poll loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-issue the receiver; `attempt` starts at 1
    Retry { attempt: u32 },
    /// Transient failure but the bound is reached
    Exhausted,
    /// Not retryable; report the exit as is
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            limit: 4,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(limit: u32, backoff: Duration) -> Self {
        RetryPolicy { limit, backoff }
    }

    pub fn classify(exit: &ExitInfo) -> ExitClass {
        if exit.success() {
            return ExitClass::Clean;
        }
        let output = exit.output.to_lowercase();
        if TRANSIENT_SIGNATURES.iter().any(|sig| output.contains(sig)) {
            ExitClass::TransientConnection
        } else {
            ExitClass::Failed
        }
    }

    /// Decide based on the exit and the retries already spent.
    pub fn decide(&self, exit: &ExitInfo, retries_so_far: u32) -> RetryDecision {
        match Self::classify(exit) {
            ExitClass::TransientConnection if retries_so_far < self.limit => RetryDecision::Retry {
                attempt: retries_so_far + 1,
            },
            ExitClass::TransientConnection => RetryDecision::Exhausted,
            ExitClass::Clean | ExitClass::Failed => RetryDecision::Finish,
        }
    }

    /// Delay before re-issue number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}
