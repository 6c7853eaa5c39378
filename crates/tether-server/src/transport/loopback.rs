//! Loopback transport: a real HTTP + WebSocket listener on the loopback
//! interface.
//!
//! The application router is wrapped, outermost first, in request tracing,
//! CORS, the strict origin check, secret-header validation, upgrade-secret
//! validation, and the channel upgrade handler. Every channel gets a writer task draining its
//! mailbox onto the socket and a reader task feeding frames to the hub.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{FromRequestParts, State};
use axum::http::header::VARY;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tether_core::{Request, Response, Result, SessionId, TetherError};
use tether_hub::{ClientMessage, Envelope, Hub, Mailbox, Session};
use tether_settings::{TransportMode, TransportSettings};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use super::{ClientChannel, Phase, Transport};
use crate::adapter::flatten_headers;
use crate::config::TransportConfig;
use crate::health::{HealthResponse, health_check};
use crate::security::{
    SECRET_HEADER, SESSION_HEADER, cors_layer, generate_secret, is_upgrade_request,
    require_secret_header, require_upgrade_secret, strict_origin,
};
use crate::shutdown::ShutdownCoordinator;

/// Transport serving the router over a loopback TCP listener.
pub struct LoopbackTransport {
    router: Router,
    hub: Arc<Hub>,
    settings: TransportSettings,
    phase: tokio::sync::Mutex<Phase>,
    config: RwLock<Arc<TransportConfig>>,
    /// `Some` exactly while running.
    client: RwLock<Option<reqwest::Client>>,
    shutdown: Arc<ShutdownCoordinator>,
    started_at: Instant,
}

impl LoopbackTransport {
    /// Create a transport; nothing is bound until [`Transport::start`].
    pub fn new(router: Router, hub: Arc<Hub>, settings: TransportSettings) -> Self {
        let mut config = TransportConfig::from_settings(&settings);
        config.mode = TransportMode::Loopback;
        Self {
            router,
            hub,
            settings,
            phase: tokio::sync::Mutex::new(Phase::Idle),
            config: RwLock::new(Arc::new(config)),
            client: RwLock::new(None),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            started_at: Instant::now(),
        }
    }

    /// Whether the listener is up.
    pub fn is_running(&self) -> bool {
        self.client.read().is_some()
    }

    /// The router as served: application routes behind the security layers
    /// and the channel upgrade handler.
    pub fn build_app(&self, config: Arc<TransportConfig>) -> Router {
        let upgrade = UpgradeState {
            hub: self.hub.clone(),
            config: config.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.router
            .clone()
            .layer(from_fn_with_state(upgrade, upgrade_channel))
            .layer(from_fn_with_state(config.clone(), require_upgrade_secret))
            .layer(from_fn_with_state(config.clone(), require_secret_header))
            .layer(from_fn_with_state(config.clone(), strict_origin))
            .layer(cors_layer(&config))
            .layer(TraceLayer::new_for_http())
    }

    fn live(&self) -> Result<(Arc<TransportConfig>, reqwest::Client)> {
        let client = self
            .client
            .read()
            .clone()
            .ok_or(TetherError::TransportClosed)?;
        Ok((self.config.read().clone(), client))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Loopback
    }

    async fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => return Err(TetherError::TransportClosed),
            Phase::Idle => {}
        }

        let requested = TransportConfig::from_settings(&self.settings);
        let bind_addr = requested.authority();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| TetherError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        // Port 0 resolves here, on the socket we keep.
        let local = listener.local_addr().map_err(|source| TetherError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        let secret = self.settings.secret.clone().unwrap_or_else(generate_secret);
        let config = Arc::new(requested.resolved(local.ip().to_string(), local.port(), secret));
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| TetherError::upstream(format!("failed to build client: {e}")))?;

        let app = self.build_app(config.clone());
        let token = self.shutdown.token();
        self.shutdown.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "loopback listener failed");
            }
        });

        *self.config.write() = config;
        *self.client.write() = Some(client);
        *phase = Phase::Running;
        info!(addr = %local, "loopback transport started");
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut phase = self.phase.lock().await;
        if *phase == Phase::Stopped {
            return Ok(());
        }
        *phase = Phase::Stopped;
        let deadline = tokio::time::Instant::now() + timeout;

        // Stop accepting first: the listener and every reader watch this token.
        *self.client.write() = None;
        self.shutdown.shutdown();

        if tokio::time::timeout_at(deadline, self.hub.close()).await.is_err() {
            warn!("hub close timed out after {timeout:?}");
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let clean = self.shutdown.graceful_shutdown(remaining).await;
        info!(clean, "loopback transport stopped");
        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Result<Response> {
        let (config, client) = self.live()?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            TetherError::InvalidRequest {
                message: format!("invalid method '{}'", request.method),
            }
        })?;
        let path = if request.url.starts_with('/') {
            request.url.clone()
        } else {
            format!("/{}", request.url)
        };

        let mut builder = client.request(method, format!("{}{path}", config.base_url()));
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(secret) = &config.secret {
            builder = builder.header(SECRET_HEADER, secret.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TetherError::upstream(e.to_string()))?;
        let mut response = Response::new(resp.status().as_u16());
        flatten_headers(&handler_headers(resp.headers()), &mut response);
        response.body = resp
            .bytes()
            .await
            .map_err(|e| TetherError::upstream(format!("failed to read body: {e}")))?
            .to_vec();
        Ok(response)
    }

    async fn open_channel(&self, path: &str) -> Result<Box<dyn ClientChannel>> {
        let (config, _) = self.live()?;
        let url = config.ws_url(path)?;

        let (stream, response) = tokio::time::timeout(
            config.handshake_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| {
            TetherError::upstream(format!(
                "channel handshake timed out after {:?}",
                config.handshake_timeout
            ))
        })?
        .map_err(handshake_error)?;

        let id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(SessionId::from)
            .ok_or_else(|| TetherError::upstream("upgrade response missing session header"))?;

        let (sink, stream) = stream.split();
        debug!(session_id = %id, path = url.path(), "channel opened");
        Ok(Box::new(LoopbackChannel {
            id,
            path: url.path().to_owned(),
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
        }))
    }

    fn config(&self) -> Arc<TransportConfig> {
        self.config.read().clone()
    }

    fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    fn health(&self) -> HealthResponse {
        health_check(
            self.started_at,
            TransportMode::Loopback,
            self.is_running(),
            self.hub.session_count(),
        )
    }
}

/// Headers hyper writes on the wire. The in-memory path never produces them.
const WIRE_HEADERS: &[&str] = &["connection", "date", "keep-alive", "transfer-encoding"];

/// Drop what the listener added to a response, keeping what the handler
/// wrote. The CORS layer appends its own `Vary`; a handler's `Vary` stays.
fn handler_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if WIRE_HEADERS.contains(&name.as_str()) || (*name == VARY && is_cors_vary(value)) {
            continue;
        }
        let _ = kept.append(name.clone(), value.clone());
    }
    kept
}

fn is_cors_vary(value: &HeaderValue) -> bool {
    value.to_str().is_ok_and(|v| {
        v.split(',').map(str::trim).all(|token| {
            let token = token.to_ascii_lowercase();
            token == "origin" || token.starts_with("access-control-request-")
        })
    })
}

fn handshake_error(error: tokio_tungstenite::tungstenite::Error) -> TetherError {
    use tokio_tungstenite::tungstenite::Error;
    match error {
        Error::Http(response) => refused_upgrade(response.status()),
        other => TetherError::upstream(format!("channel handshake failed: {other}")),
    }
}

/// Map the status of a refused upgrade back onto the error the server raised.
fn refused_upgrade(status: StatusCode) -> TetherError {
    match status {
        StatusCode::UNAUTHORIZED => TetherError::unauthorized("channel upgrade refused"),
        StatusCode::SERVICE_UNAVAILABLE => TetherError::TransportClosed,
        status => TetherError::rejected(format!("channel upgrade refused with {status}")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct UpgradeState {
    hub: Arc<Hub>,
    config: Arc<TransportConfig>,
    shutdown: Arc<ShutdownCoordinator>,
}

fn error_response(error: &TetherError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.to_string()).into_response()
}

/// Register the session, then upgrade. A refused connect never upgrades.
async fn upgrade_channel(
    State(state): State<UpgradeState>,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    if !is_upgrade_request(request.headers()) {
        return next.run(request).await;
    }
    if state.shutdown.is_shutting_down() {
        return error_response(&TetherError::TransportClosed);
    }

    let path = request.uri().path().to_owned();
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let session = match state.hub.connect(&path).await {
        Ok(session) => session,
        Err(e) => {
            warn!(path, error = %e, "channel refused");
            return error_response(&e);
        }
    };
    let Some(mailbox) = session.take_mailbox() else {
        state.hub.disconnect(session.id()).await;
        return error_response(&TetherError::ChannelClosed {
            session_id: session.id().to_string(),
        });
    };
    let id = session.id().clone();
    let session_header = HeaderValue::from_str(id.as_str());

    let failed = (state.hub.clone(), id.clone(), state.shutdown.clone());
    let mut response = upgrade
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(move |e| {
            let (hub, id, shutdown) = failed;
            warn!(session_id = %id, error = %e, "channel upgrade failed");
            shutdown.spawn(async move { hub.disconnect(&id).await });
        })
        .on_upgrade(move |socket| async move {
            spawn_channel_tasks(socket, session, mailbox, &state);
        });

    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(SESSION_HEADER.as_bytes()), session_header) {
        let _ = response.headers_mut().insert(name, value);
    }
    response
}

fn spawn_channel_tasks(
    socket: WebSocket,
    session: Arc<Session>,
    mailbox: Mailbox,
    state: &UpgradeState,
) {
    let (ws_tx, ws_rx) = socket.split();
    state.shutdown.spawn(write_channel(
        ws_tx,
        session.clone(),
        mailbox,
        state.config.heartbeat_interval,
    ));
    state.shutdown.spawn(read_channel(
        ws_rx,
        session,
        state.hub.clone(),
        state.shutdown.token(),
    ));
}

/// Drain the mailbox onto the socket until the session closes, then send a
/// close frame.
#[instrument(skip_all, fields(session_id = %session.id()))]
async fn write_channel(
    mut ws_tx: SplitSink<WebSocket, Message>,
    session: Arc<Session>,
    mut mailbox: Mailbox,
    heartbeat: Duration,
) {
    let mut ping_interval = tokio::time::interval(heartbeat);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { break };
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable envelope");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    debug!("socket write failed");
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let close = CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("Session closed"),
    };
    let _ = ws_tx.send(Message::Close(Some(close))).await;
    let _ = ws_tx.close().await;
}

/// Feed inbound frames to the hub; disconnect the session on exit.
#[instrument(skip_all, fields(session_id = %session.id()))]
async fn read_channel(
    mut ws_rx: SplitStream<WebSocket>,
    session: Arc<Session>,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
) {
    let closed = session.close_token();
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            () = closed.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                break;
            }
            None => break,
        };
        let payload: &[u8] = match &message {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match hub.handle_message(session.id(), payload).await {
            Ok(Some(reply)) => {
                if let Err(e) = session.send(reply) {
                    warn!(error = %e, "reply not queued");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "message handling failed"),
        }
    }
    hub.disconnect(session.id()).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client end of a loopback channel: a WebSocket to the transport's listener.
pub struct LoopbackChannel {
    id: SessionId,
    path: String,
    sink: tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>,
    stream: tokio::sync::Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl ClientChannel for LoopbackChannel {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn path(&self) -> &str {
        &self.path
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        self.sink
            .lock()
            .await
            .send(WsMessage::text(json))
            .await
            .map_err(|_| TetherError::ChannelClosed {
                session_id: self.id.to_string(),
            })
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut stream = self.stream.lock().await;
        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(_)) | None => return None,
            };
            let data: &[u8] = match &message {
                WsMessage::Text(text) => text.as_str().as_bytes(),
                WsMessage::Binary(data) => &data[..],
                WsMessage::Close(_) => return None,
                _ => continue,
            };
            match Envelope::from_json(data) {
                Ok(envelope) => return Some(envelope),
                Err(e) => warn!(session_id = %self.id, error = %e, "skipping unparseable frame"),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let _ = self.sink.lock().await.close().await;
        Ok(())
    }
}
