//! Resolved per-instance transport configuration.
//!
//! [`TransportSettings`] is what the user asked for; [`TransportConfig`] is
//! what a running transport actually uses: concrete port, the secret in
//! force, and the origin allow-list with its default filled in.

use std::time::Duration;

use tether_core::{Result, TetherError};
use tether_settings::{TransportMode, TransportSettings};
use url::Url;

use crate::security::SECRET_QUERY_PARAM;

/// Configuration of one transport instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Which transport this config belongs to.
    pub mode: TransportMode,
    /// Host the listener is bound to.
    pub address: String,
    /// Listener port (`0` until a loopback transport has started).
    pub port: u16,
    /// Secret required on loopback requests. `None` for in-process.
    pub secret: Option<String>,
    /// Allowed `Origin` header values.
    pub allowed_origins: Vec<String>,
    /// Path prefixes that skip the secret-header check.
    pub exempt_prefixes: Vec<String>,
    /// Timeout for a loopback request round trip.
    pub request_timeout: Duration,
    /// Timeout for a loopback channel handshake.
    pub handshake_timeout: Duration,
    /// Interval between server pings on a channel.
    pub heartbeat_interval: Duration,
    /// Largest accepted inbound channel frame.
    pub max_message_size: usize,
}

impl TransportConfig {
    /// Unresolved config straight from settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            mode: settings.mode,
            address: settings.address.clone(),
            port: settings.port,
            secret: settings.secret.clone(),
            allowed_origins: settings.allowed_origins.clone(),
            exempt_prefixes: settings.exempt_prefixes.clone(),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            max_message_size: settings.max_message_size,
        }
    }

    /// Fill in the bound address, the secret in force, and the default origin.
    #[must_use]
    pub fn resolved(mut self, address: impl Into<String>, port: u16, secret: String) -> Self {
        self.address = address.into();
        self.port = port;
        self.secret = Some(secret);
        if self.allowed_origins.is_empty() {
            self.allowed_origins = vec![self.origin()];
        }
        self
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// The transport's own origin, e.g. `http://127.0.0.1:41234`.
    pub fn origin(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// Base URL for HTTP requests (same as [`origin`](Self::origin)).
    pub fn base_url(&self) -> String {
        self.origin()
    }

    /// WebSocket URL for `path`, carrying the secret as a query parameter.
    pub fn ws_url(&self, path: &str) -> Result<Url> {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        let mut url = Url::parse(&format!("ws://{}{path}", self.authority())).map_err(|e| {
            TetherError::InvalidRequest {
                message: format!("invalid channel path '{path}': {e}"),
            }
        })?;
        if let Some(secret) = &self.secret {
            let _ = url
                .query_pairs_mut()
                .append_pair(SECRET_QUERY_PARAM, secret);
        }
        Ok(url)
    }

    /// Whether `path` skips the secret-header check.
    ///
    /// A prefix ending in `/` covers everything below it. Any other prefix is
    /// a whole path segment: `/health` exempts `/health` and `/health/live`,
    /// never `/healthcare`.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes.iter().any(|prefix| {
            if prefix.is_empty() {
                false
            } else if prefix.ends_with('/') {
                path.starts_with(prefix.as_str())
            } else {
                path.strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            }
        })
    }

    /// Whether `origin` is on the allow-list.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_settings(&TransportSettings::default())
    }
}
