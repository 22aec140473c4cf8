//! Concurrency, timeout and query limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource bounds enforced by the dispatcher, the sessions and the tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// In-flight handler invocations allowed per session.
    #[serde(default = "default_per_session")]
    pub max_concurrent_per_session: usize,

    /// In-flight handler invocations allowed across all sessions.
    #[serde(default = "default_global")]
    pub max_concurrent_global: usize,

    /// Deadline for a single handler invocation.
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,

    /// How long a draining session waits for outstanding invocations.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Sessions with no inbound traffic and nothing in flight are closed after this.
    #[serde(default = "default_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,

    /// Outbound events retained per push-stream connection for resumption.
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,

    /// Maximum allowed query length in characters.
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Maximum number of rows returned by a query.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_session: default_per_session(),
            max_concurrent_global: default_global(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            session_idle_timeout_secs: default_idle_timeout_secs(),
            replay_buffer_size: default_replay_buffer_size(),
            max_query_length: default_max_query_length(),
            max_result_rows: default_max_result_rows(),
        }
    }
}

impl LimitsConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

fn default_per_session() -> usize {
    8
}

fn default_global() -> usize {
    64
}

fn default_invocation_timeout_ms() -> u64 {
    30_000
}

fn default_drain_grace_ms() -> u64 {
    5_000
}

fn default_idle_timeout_secs() -> u64 {
    1_800
}

fn default_replay_buffer_size() -> usize {
    256
}

fn default_max_query_length() -> usize {
    10_000
}

fn default_max_result_rows() -> usize {
    1_000
}
