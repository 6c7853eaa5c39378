//! Error taxonomy for adapter, hub, and transport operations.
//!
//! Every variant maps to a stable machine-readable code ([`TetherError::code`])
//! and to the HTTP-equivalent status a bridge reports when the failure has to
//! be expressed as a response ([`TetherError::status`]).

use thiserror::Error;

/// Errors surfaced by the tether crates.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Operation attempted after the transport was stopped (or before it started).
    #[error("transport is closed")]
    TransportClosed,

    /// A session with this ID is already registered.
    #[error("session already exists: {session_id}")]
    DuplicateSession {
        /// The conflicting session ID.
        session_id: String,
    },

    /// No session with this ID is registered.
    #[error("unknown session: {session_id}")]
    UnknownSession {
        /// The requested session ID.
        session_id: String,
    },

    /// An inbound frame failed to parse.
    #[error("malformed message: {message}")]
    MalformedMessage {
        /// Parser diagnostic.
        message: String,
    },

    /// Neither a matching pattern nor a default handler is registered.
    #[error("no handler registered for path '{path}'")]
    NoHandler {
        /// The session path that failed to resolve.
        path: String,
    },

    /// A non-blocking send found the mailbox at capacity.
    #[error("channel full: {session_id}")]
    ChannelFull {
        /// Target session ID.
        session_id: String,
    },

    /// Send or receive on a closed channel.
    #[error("channel closed: {session_id}")]
    ChannelClosed {
        /// Target session ID.
        session_id: String,
    },

    /// The hub has been closed.
    #[error("hub is closed")]
    HubClosed,

    /// The core was invoked before its bridge was set up.
    #[error("bridge not initialized")]
    BridgeNotInitialized,

    /// A secret or origin check failed.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Which check failed.
        reason: String,
    },

    /// A channel handler refused a connection or failed to process a message.
    #[error("rejected by handler: {message}")]
    Rejected {
        /// Handler-supplied reason.
        message: String,
    },

    /// A structured request could not be turned into an HTTP request.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// The loopback listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was being bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An HTTP or WebSocket client call over the loopback interface failed.
    #[error("upstream error: {message}")]
    Upstream {
        /// Client diagnostic.
        message: String,
    },
}

impl TetherError {
    /// Shorthand for a handler rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Shorthand for a security failure.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Shorthand for a loopback client failure.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::DuplicateSession { .. } => "DUPLICATE_SESSION",
            Self::UnknownSession { .. } => "UNKNOWN_SESSION",
            Self::MalformedMessage { .. } => "MALFORMED_MESSAGE",
            Self::NoHandler { .. } => "NO_HANDLER",
            Self::ChannelFull { .. } => "CHANNEL_FULL",
            Self::ChannelClosed { .. } => "CHANNEL_CLOSED",
            Self::HubClosed => "HUB_CLOSED",
            Self::BridgeNotInitialized => "BRIDGE_NOT_INITIALIZED",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Rejected { .. } => "REJECTED",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::Bind { .. } => "BIND_FAILED",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
        }
    }

    /// HTTP-equivalent status for reporting this error as a response.
    pub fn status(&self) -> u16 {
        match self {
            Self::MalformedMessage { .. } | Self::InvalidRequest { .. } => 400,
            Self::Unauthorized { .. } | Self::Rejected { .. } => 403,
            Self::UnknownSession { .. } | Self::NoHandler { .. } => 404,
            Self::DuplicateSession { .. } => 409,
            Self::ChannelFull { .. } => 429,
            Self::Upstream { .. } => 502,
            Self::TransportClosed
            | Self::ChannelClosed { .. }
            | Self::HubClosed
            | Self::BridgeNotInitialized => 503,
            Self::Bind { .. } => 500,
        }
    }
}

/// Result type for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn duplicate_session_display() {
        let err = TetherError::DuplicateSession {
            session_id: "s1".into(),
        };
        assert_eq!(err.to_string(), "session already exists: s1");
        assert_eq!(err.code(), "DUPLICATE_SESSION");
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn no_handler_mentions_path() {
        let err = TetherError::NoHandler {
            path: "/chat".into(),
        };
        assert!(err.to_string().contains("/chat"));
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn unauthorized_is_forbidden() {
        let err = TetherError::unauthorized("missing secret");
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert_eq!(err.status(), 403);
        assert_eq!(err.to_string(), "unauthorized: missing secret");
    }

    #[test]
    fn channel_full_is_429() {
        let err = TetherError::ChannelFull {
            session_id: "s2".into(),
        };
        assert_eq!(err.status(), 429);
        assert_eq!(err.code(), "CHANNEL_FULL");
    }

    #[test]
    fn closed_states_are_unavailable() {
        for err in [
            TetherError::TransportClosed,
            TetherError::HubClosed,
            TetherError::BridgeNotInitialized,
            TetherError::ChannelClosed {
                session_id: "x".into(),
            },
        ] {
            assert_eq!(err.status(), 503, "{err}");
        }
    }

    #[test]
    fn bind_error_keeps_source() {
        let err = TetherError::Bind {
            addr: "127.0.0.1:80".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("127.0.0.1:80"));
    }

    #[test]
    fn rejected_shorthand() {
        assert_matches!(
            TetherError::rejected("nope"),
            TetherError::Rejected { message } if message == "nope"
        );
    }
}
