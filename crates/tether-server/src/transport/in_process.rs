//! In-process transport: no listener, no sockets.
//!
//! Requests go straight through the [`VirtualHttpAdapter`]; channels talk to
//! the hub directly and messages are handed over as values, never encoded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use tether_core::{Request, Response, Result, SessionId, TetherError};
use tether_hub::{ClientMessage, Envelope, Hub, Mailbox, Session};
use tether_settings::{TransportMode, TransportSettings};
use tracing::{debug, info, warn};

use super::{ClientChannel, Phase, Transport};
use crate::adapter::VirtualHttpAdapter;
use crate::config::TransportConfig;
use crate::health::{HealthResponse, health_check};

/// Transport that calls the adapter and hub directly.
pub struct InProcessTransport {
    adapter: RwLock<Option<VirtualHttpAdapter>>,
    hub: Arc<Hub>,
    config: Arc<TransportConfig>,
    phase: Mutex<Phase>,
    started_at: Instant,
}

impl InProcessTransport {
    /// Create a transport serving `router`.
    pub fn new(router: Router, hub: Arc<Hub>, settings: TransportSettings) -> Self {
        let transport = Self::unrouted(hub, settings);
        transport.set_router(router);
        transport
    }

    /// Create a transport with no router yet; requests fail with
    /// `BridgeNotInitialized` until [`set_router`](Self::set_router).
    pub fn unrouted(hub: Arc<Hub>, settings: TransportSettings) -> Self {
        let mut config = TransportConfig::from_settings(&settings);
        config.mode = TransportMode::InProcess;
        config.secret = None;
        Self {
            adapter: RwLock::new(None),
            hub,
            config: Arc::new(config),
            phase: Mutex::new(Phase::Idle),
            started_at: Instant::now(),
        }
    }

    /// Install or replace the application router.
    pub fn set_router(&self, router: Router) {
        *self.adapter.write() = Some(VirtualHttpAdapter::new(router));
    }

    /// Whether a router is installed.
    pub fn has_router(&self) -> bool {
        self.adapter.read().is_some()
    }

    /// Whether the transport is running.
    pub fn is_running(&self) -> bool {
        *self.phase.lock() == Phase::Running
    }

    /// Register a session under a caller-chosen ID and hand back its state.
    pub(crate) async fn connect_with_id(&self, id: SessionId, path: &str) -> Result<Arc<Session>> {
        self.phase.lock().ensure_running()?;
        self.hub.connect_with_id(id, path).await
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::InProcess
    }

    async fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Running => Ok(()),
            Phase::Stopped => Err(TetherError::TransportClosed),
            Phase::Idle => {
                *phase = Phase::Running;
                info!("in-process transport started");
                Ok(())
            }
        }
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Stopped {
                return Ok(());
            }
            *phase = Phase::Stopped;
        }
        if tokio::time::timeout(timeout, self.hub.close()).await.is_err() {
            warn!("hub close timed out after {timeout:?}");
        }
        info!("in-process transport stopped");
        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Result<Response> {
        self.phase.lock().ensure_running()?;
        let adapter = self
            .adapter
            .read()
            .clone()
            .ok_or(TetherError::BridgeNotInitialized)?;
        Ok(adapter.execute(&request).await)
    }

    async fn open_channel(&self, path: &str) -> Result<Box<dyn ClientChannel>> {
        let session = self.connect_with_id(SessionId::new(), path).await?;
        let channel = InProcessChannel::attach(self.hub.clone(), session)?;
        Ok(Box::new(channel))
    }

    fn config(&self) -> Arc<TransportConfig> {
        self.config.clone()
    }

    fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    fn health(&self) -> HealthResponse {
        health_check(
            self.started_at,
            TransportMode::InProcess,
            self.is_running(),
            self.hub.session_count(),
        )
    }
}

/// Client end of an in-process channel: holds the session's mailbox.
pub struct InProcessChannel {
    hub: Arc<Hub>,
    session: Arc<Session>,
    mailbox: tokio::sync::Mutex<Mailbox>,
    closed: AtomicBool,
}

impl InProcessChannel {
    /// Take ownership of `session`'s mailbox.
    pub fn attach(hub: Arc<Hub>, session: Arc<Session>) -> Result<Self> {
        let mailbox = session.take_mailbox().ok_or_else(|| TetherError::ChannelClosed {
            session_id: session.id().to_string(),
        })?;
        Ok(Self {
            hub,
            session,
            mailbox: tokio::sync::Mutex::new(mailbox),
            closed: AtomicBool::new(false),
        })
    }

    fn closed_error(&self) -> TetherError {
        TetherError::ChannelClosed {
            session_id: self.session.id().to_string(),
        }
    }
}

#[async_trait]
impl ClientChannel for InProcessChannel {
    fn id(&self) -> &SessionId {
        self.session.id()
    }

    fn path(&self) -> &str {
        self.session.path()
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        if self.session.is_closed() {
            return Err(self.closed_error());
        }
        match self.hub.dispatch(self.session.id(), message.clone()).await {
            Ok(Some(reply)) => {
                if let Err(e) = self.session.send(reply) {
                    warn!(session_id = %self.session.id(), error = %e, "reply not queued");
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(TetherError::UnknownSession { .. } | TetherError::HubClosed) => {
                Err(self.closed_error())
            }
            Err(e) => {
                // Same outcome as a socket client: the handler failure is
                // logged server-side and the channel stays open.
                warn!(session_id = %self.session.id(), error = %e, "message handling failed");
                Ok(())
            }
        }
    }

    async fn recv(&self) -> Option<Envelope> {
        self.mailbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.disconnect(self.session.id()).await;
        }
        Ok(())
    }
}

impl Drop for InProcessChannel {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropped without close: disconnect in the background if a runtime
        // is still around.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let id = self.session.id().clone();
            debug!(session_id = %id, "channel dropped without close");
            let _ = runtime.spawn(async move { hub.disconnect(&id).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::routing::get;
    use tether_hub::{Channel, handler_fn};
    use tether_settings::HubSettings;

    fn transport() -> InProcessTransport {
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        InProcessTransport::new(
            router,
            Arc::new(Hub::new(HubSettings::default())),
            TransportSettings::default(),
        )
    }

    fn echo() -> Arc<dyn tether_hub::ChannelHandler> {
        handler_fn(|_ch: Arc<dyn Channel>, msg: ClientMessage| async move {
            let text = msg.str_value("text").unwrap_or_default().to_owned();
            Ok::<_, TetherError>(Some(Envelope::reply(msg.request_id, text)))
        })
    }

    #[tokio::test]
    async fn requests_need_a_started_transport() {
        let t = transport();
        assert_matches!(
            t.handle_request(Request::new("GET", "/ping")).await,
            Err(TetherError::TransportClosed)
        );
        t.start().await.unwrap();
        t.start().await.unwrap();
        let resp = t.handle_request(Request::new("GET", "/ping")).await.unwrap();
        assert_eq!(resp.body_str(), "pong");
    }

    #[tokio::test]
    async fn unrouted_transport_reports_not_initialized() {
        let t = InProcessTransport::unrouted(
            Arc::new(Hub::default()),
            TransportSettings::default(),
        );
        t.start().await.unwrap();
        assert!(!t.has_router());
        assert_matches!(
            t.handle_request(Request::new("GET", "/")).await,
            Err(TetherError::BridgeNotInitialized)
        );
        t.set_router(Router::new().route("/", get(|| async { "root" })));
        assert_eq!(
            t.handle_request(Request::new("GET", "/")).await.unwrap().status,
            200
        );
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let t = transport();
        t.register_channel_handler("/echo", echo());
        t.start().await.unwrap();

        let ch = t.open_channel("/echo").await.unwrap();
        assert_eq!(ch.path(), "/echo");
        assert_eq!(t.hub().session_count(), 1);

        ch.send(&ClientMessage::request("r1").with_value("text", "hi"))
            .await
            .unwrap();
        let reply = ch.recv().await.unwrap();
        assert_eq!(reply.payload, "hi");
        assert_eq!(reply.request_id.as_deref(), Some("r1"));

        ch.close().await.unwrap();
        assert_eq!(t.hub().session_count(), 0);
        assert_matches!(
            ch.send(&ClientMessage::request("r2")).await,
            Err(TetherError::ChannelClosed { .. })
        );
        assert!(ch.recv().await.is_none());
    }

    #[tokio::test]
    async fn handler_errors_keep_channel_open() {
        let t = transport();
        t.start().await.unwrap();
        // No handler registered for this path.
        let ch = t.open_channel("/nowhere").await.unwrap();
        ch.send(&ClientMessage::request("r1")).await.unwrap();
        assert_eq!(t.hub().session_count(), 1);
    }

    #[tokio::test]
    async fn handler_close_ends_channel_and_session() {
        let t = transport();
        t.register_channel_handler(
            "/bye",
            handler_fn(|ch: Arc<dyn Channel>, _msg: ClientMessage| async move {
                ch.send(Envelope::html("bye"))?;
                ch.close();
                Ok::<_, TetherError>(None)
            }),
        );
        t.start().await.unwrap();
        let ch = t.open_channel("/bye").await.unwrap();

        ch.send(&ClientMessage::request("r1")).await.unwrap();
        assert_eq!(t.hub().session_count(), 0);
        assert!(t.hub().session(ch.id()).is_none());

        assert_eq!(ch.recv().await.unwrap().payload, "bye");
        assert!(ch.recv().await.is_none());
        assert_matches!(
            ch.send(&ClientMessage::request("r2")).await,
            Err(TetherError::ChannelClosed { .. })
        );
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_channel_is_disconnected() {
        let t = transport();
        t.start().await.unwrap();
        let ch = t.open_channel("/echo").await.unwrap();
        drop(ch);
        for _ in 0..50 {
            if t.hub().session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(t.hub().session_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_terminal_and_closes_sessions() {
        let t = transport();
        t.start().await.unwrap();
        let ch = t.open_channel("/echo").await.unwrap();

        t.stop(Duration::from_secs(1)).await.unwrap();
        t.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(t.hub().session_count(), 0);
        assert!(ch.recv().await.is_none());

        assert_matches!(t.start().await, Err(TetherError::TransportClosed));
        assert_matches!(
            t.open_channel("/echo").await.err(),
            Some(TetherError::TransportClosed)
        );
        assert_eq!(t.health().status, "stopped");
    }
}
