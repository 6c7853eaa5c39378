//! Transport health snapshot.

use serde::Serialize;
use std::time::Instant;

use tether_settings::TransportMode;

/// Health report for a running transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` while running, `"stopped"` otherwise.
    pub status: String,
    /// Which transport produced the report.
    pub mode: TransportMode,
    /// Seconds since the transport was created.
    pub uptime_secs: u64,
    /// Sessions registered with the hub.
    pub sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    mode: TransportMode,
    running: bool,
    sessions: usize,
) -> HealthResponse {
    HealthResponse {
        status: if running { "ok" } else { "stopped" }.into(),
        mode,
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
    }
}
