//! Runtime defaults.
//!
//! Matching the teacher's stance on configuration: this is a plain struct
//! with a `Default` impl, not a config-file format. No TOML/YAML parsing
//! dependency is introduced; if a caller wants file-backed config they
//! deserialize a `ChorusConfig` with `serde_json` themselves.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a [`crate::workspace::WorkspaceController`] and the
/// components it spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusConfig {
    /// Soft capacity of every per-principal inbox.
    pub inbox_capacity: usize,
    /// How long a direct send blocks waiting for inbox room before failing
    /// with `ErrorKind::InboxFull`.
    pub backpressure_timeout_ms: u64,
    /// Minimum spacing between consecutive `iterate()` calls on an active
    /// agent with an empty inbox.
    pub iterate_interval_ms: u64,
    /// How long a stopping agent runtime is given to react to cancellation
    /// before it is abandoned.
    pub handler_cancel_grace_ms: u64,
    /// How long a team service is given to drain its queue before
    /// outstanding invocations are force-cancelled.
    pub team_service_shutdown_grace_ms: u64,
    /// Default parallelism for a `TeamServiceRuntime`.
    pub team_service_parallelism: usize,
    /// How often the stop-condition evaluator is polled.
    pub stop_condition_poll_ms: u64,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            backpressure_timeout_ms: 500,
            iterate_interval_ms: 100,
            handler_cancel_grace_ms: 2_000,
            team_service_shutdown_grace_ms: 5_000,
            team_service_parallelism: 4,
            stop_condition_poll_ms: 50,
        }
    }
}

impl ChorusConfig {
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    pub fn iterate_interval(&self) -> Duration {
        Duration::from_millis(self.iterate_interval_ms)
    }

    pub fn handler_cancel_grace(&self) -> Duration {
        Duration::from_millis(self.handler_cancel_grace_ms)
    }

    pub fn team_service_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.team_service_shutdown_grace_ms)
    }

    pub fn stop_condition_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_condition_poll_ms)
    }
}
