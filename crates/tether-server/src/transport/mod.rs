//! Transport abstraction.
//!
//! A [`Transport`] binds the application's router and channel handlers to a
//! physical medium. Handlers cannot tell which one is in use.
//!
//! Lifecycle: `Idle → Running → Stopped`. `start` on a running transport is
//! a no-op; `stop` is idempotent and terminal (a stopped transport cannot be
//! restarted, every operation afterwards fails with `TransportClosed`).

mod in_process;
mod loopback;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tether_core::{Request, Response, Result, SessionId, TetherError};
use tether_hub::{ChannelHandler, ClientMessage, Envelope, Hub};
use tether_settings::{TetherSettings, TransportMode};

use crate::config::TransportConfig;
use crate::health::HealthResponse;

pub use in_process::{InProcessChannel, InProcessTransport};
pub use loopback::{LoopbackChannel, LoopbackTransport};

/// A physical binding for the request/response and channel core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which binding this is.
    fn mode(&self) -> TransportMode;

    /// Bring the transport up. Loopback binds its listener here.
    async fn start(&self) -> Result<()>;

    /// Stop accepting work, close every session, and wait up to `timeout`
    /// for transport tasks before aborting them.
    async fn stop(&self, timeout: Duration) -> Result<()>;

    /// Run one request through the application router.
    async fn handle_request(&self, request: Request) -> Result<Response>;

    /// Open a client channel to `path`.
    async fn open_channel(&self, path: &str) -> Result<Box<dyn ClientChannel>>;

    /// Route channels whose path matches `pattern` to `handler`.
    fn register_channel_handler(&self, pattern: &str, handler: Arc<dyn ChannelHandler>) {
        self.hub().register_handler(pattern, handler);
    }

    /// Handler for channels no pattern matches.
    fn set_default_channel_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.hub().set_default_handler(handler);
    }

    /// Configuration in force (resolved once started).
    fn config(&self) -> Arc<TransportConfig>;

    /// The session hub behind this transport.
    fn hub(&self) -> Arc<Hub>;

    /// Health snapshot.
    fn health(&self) -> HealthResponse;
}

/// The client end of a channel opened through a [`Transport`].
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Session ID assigned by the hub.
    fn id(&self) -> &SessionId;

    /// Path the channel was opened against.
    fn path(&self) -> &str;

    /// Send a message to the server-side handler.
    async fn send(&self, message: &ClientMessage) -> Result<()>;

    /// Next envelope from the server; `None` once the channel is closed and
    /// drained.
    async fn recv(&self) -> Option<Envelope>;

    /// Close the channel. The hub forgets the session.
    async fn close(&self) -> Result<()>;
}

/// Lifecycle phase shared by both transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Running,
    Stopped,
}

impl Phase {
    pub(crate) fn ensure_running(self) -> Result<()> {
        match self {
            Self::Running => Ok(()),
            Self::Idle | Self::Stopped => Err(TetherError::TransportClosed),
        }
    }
}

/// Build the transport selected by `mode`, with a fresh hub.
pub fn build_transport(
    mode: TransportMode,
    router: Router,
    settings: &TetherSettings,
) -> Arc<dyn Transport> {
    let hub = Arc::new(Hub::new(settings.hub.clone()));
    match mode {
        TransportMode::Loopback => Arc::new(LoopbackTransport::new(
            router,
            hub,
            settings.transport.clone(),
        )),
        TransportMode::InProcess => Arc::new(InProcessTransport::new(
            router,
            hub,
            settings.transport.clone(),
        )),
    }
}
