//! Settings types with compiled defaults.
//!
//! JSON field names are camelCase; every struct is `#[serde(default)]` so a
//! partial settings file only needs the keys it changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Transport selection and loopback listener options.
    pub transport: TransportSettings,
    /// Session hub options.
    pub hub: HubSettings,
    /// Logging options.
    pub logging: LoggingSettings,
}

/// Which physical binding drives the core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Real TCP listener on the loopback interface.
    #[default]
    Loopback,
    /// Direct function calls; no listener, no sockets.
    InProcess,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loopback" | "socket" => Ok(Self::Loopback),
            "in-process" | "inprocess" | "in_process" | "embedded" => Ok(Self::InProcess),
            other => Err(format!("unknown transport mode '{other}'")),
        }
    }
}

impl TransportMode {
    /// Environment variable consulted by [`from_env_or`](Self::from_env_or).
    pub const ENV_VAR: &'static str = "TETHER_TRANSPORT";

    /// Mode named by `TETHER_TRANSPORT`, or `default` when unset or invalid.
    pub fn from_env_or(default: Self) -> Self {
        Self::from_lookup_or(default, |key| std::env::var(key).ok())
    }

    /// [`from_env_or`](Self::from_env_or) against an arbitrary variable source.
    pub fn from_lookup_or<F>(default: Self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(Self::ENV_VAR) {
            Some(value) if !value.trim().is_empty() => value.parse().unwrap_or_else(|e| {
                tracing::warn!(key = Self::ENV_VAR, value = %value, error = %e, "invalid transport mode, using default");
                default
            }),
            _ => default,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loopback => "loopback",
            Self::InProcess => "in-process",
        })
    }
}

/// Transport options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Transport mode chosen by the embedding application.
    pub mode: TransportMode,
    /// Listen address for the loopback transport.
    pub address: String,
    /// Listen port; `0` resolves an ephemeral port at start.
    pub port: u16,
    /// Per-launch secret; generated at start when absent.
    pub secret: Option<String>,
    /// Allowed `Origin` values; empty means "the transport's own origin".
    pub allowed_origins: Vec<String>,
    /// Path prefixes that do not require the secret header.
    pub exempt_prefixes: Vec<String>,
    /// Timeout for loopback `handle_request` round trips.
    pub request_timeout_ms: u64,
    /// Timeout for loopback channel handshakes.
    pub handshake_timeout_ms: u64,
    /// Interval between server-initiated WebSocket pings.
    pub heartbeat_interval_secs: u64,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            mode: TransportMode::Loopback,
            address: "127.0.0.1".into(),
            port: 0,
            secret: None,
            allowed_origins: Vec::new(),
            exempt_prefixes: vec!["/static/".into(), "/health".into()],
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// What a broadcast does when a session's mailbox is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlowConsumerPolicy {
    /// Drop the message for that session and keep going.
    #[default]
    Drop,
    /// Drop the message and disconnect the session.
    Disconnect,
}

impl FromStr for SlowConsumerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(format!("unknown slow-consumer policy '{other}'")),
        }
    }
}

/// Session hub options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Capacity of each session's outbound mailbox.
    pub mailbox_capacity: usize,
    /// Broadcast behaviour toward full mailboxes.
    pub slow_consumer: SlowConsumerPolicy,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            slow_consumer: SlowConsumerPolicy::Drop,
        }
    }
}

/// Logging options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".into(),
        }
    }
}
