//! Native bridge: the entry points a mobile or desktop host calls when the
//! UI and the core share an address space.
//!
//! A [`Bridge`] wraps an [`InProcessTransport`]. The host passes plain
//! strings and bytes in and gets plain data back; nothing here panics or
//! returns an error across the boundary for a request: failures become
//! error responses.
//!
//! Pushed envelopes reach the host one of two ways:
//! - with a [`NativeCallback`] installed, a forwarder task per session calls
//!   [`NativeCallback::on_message`] for every envelope;
//! - without one, the session's mailbox is parked and the host polls it
//!   with [`Bridge::ws_poll`] / [`Bridge::ws_poll_timeout`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use parking_lot::{Mutex, RwLock};
use tether_core::{Request, Response, Result, SessionId, TetherError};
use tether_hub::{BroadcastReport, ChannelHandler, Envelope, Hub, Mailbox, Session};
use tether_settings::TetherSettings;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownCoordinator;
use crate::transport::{InProcessTransport, Transport};

/// Close code reported when a session's mailbox closes.
pub const NORMAL_CLOSE: u16 = 1000;

const ERROR_PAGE: &str = "<html><body><h1>Error loading app</h1></body></html>";

/// Host-side receiver for pushed envelopes.
///
/// Called from a runtime worker thread; implementations hand the data to the
/// UI thread themselves.
pub trait NativeCallback: Send + Sync {
    /// An envelope for `session_id`, as JSON.
    fn on_message(&self, session_id: &str, json: &str);

    /// The session closed.
    fn on_close(&self, session_id: &str, code: u16, reason: &str);

    /// An envelope could not be delivered.
    fn on_error(&self, session_id: &str, message: &str);
}

type ParkedMailbox = Arc<tokio::sync::Mutex<Mailbox>>;

/// Handle threaded through every native entry point.
pub struct Bridge {
    transport: InProcessTransport,
    hub: Arc<Hub>,
    callback: RwLock<Option<Arc<dyn NativeCallback>>>,
    parked: Mutex<HashMap<SessionId, ParkedMailbox>>,
    forwarders: ShutdownCoordinator,
}

impl Bridge {
    /// Create and start a bridge. Requests fail with 500 until
    /// [`set_handler`](Self::set_handler) installs a router.
    pub async fn new(settings: &TetherSettings) -> Result<Self> {
        let hub = Arc::new(Hub::new(settings.hub.clone()));
        let transport = InProcessTransport::unrouted(hub.clone(), settings.transport.clone());
        transport.start().await?;
        Ok(Self {
            transport,
            hub,
            callback: RwLock::new(None),
            parked: Mutex::new(HashMap::new()),
            forwarders: ShutdownCoordinator::new(),
        })
    }

    /// Install or replace the application router.
    pub fn set_handler(&self, router: Router) {
        self.transport.set_router(router);
        info!("bridge handler installed");
    }

    /// Whether requests can be served.
    pub fn is_ready(&self) -> bool {
        self.transport.is_running() && self.transport.has_router()
    }

    /// The hub behind the bridge.
    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    /// Route channels whose path matches `pattern` to `handler`.
    pub fn register_channel_handler(&self, pattern: &str, handler: Arc<dyn ChannelHandler>) {
        self.transport.register_channel_handler(pattern, handler);
    }

    /// Handler for channels no pattern matches.
    pub fn set_default_channel_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.transport.set_default_channel_handler(handler);
    }

    // ── HTTP ────────────────────────────────────────────────────────────────

    /// Serve one request. `headers_json` is a JSON object of header values;
    /// anything else is treated as no headers.
    pub async fn handle_request(
        &self,
        method: &str,
        url: &str,
        headers_json: &str,
        body: &[u8],
    ) -> Response {
        if !self.is_ready() {
            return Response::error(500, "Bridge not initialized");
        }

        let headers = if headers_json.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str::<BTreeMap<String, String>>(headers_json).unwrap_or_else(|e| {
                debug!(error = %e, "ignoring unparseable headers");
                BTreeMap::new()
            })
        };
        let request = Request {
            method: method.to_owned(),
            url: url.to_owned(),
            headers,
            body: body.to_vec(),
        };

        self.transport
            .handle_request(request)
            .await
            .unwrap_or_else(|e| Response::error(e.status(), e.to_string()))
    }

    /// [`handle_request`](Self::handle_request) with no headers or body.
    pub async fn handle_request_simple(&self, method: &str, url: &str) -> Response {
        self.handle_request(method, url, "{}", &[]).await
    }

    /// Serve a request given in its JSON wire form and answer in the same
    /// form.
    pub async fn handle_request_json(&self, data: &[u8]) -> Vec<u8> {
        let response = match Request::from_json(data) {
            Ok(request) if self.is_ready() => self
                .transport
                .handle_request(request)
                .await
                .unwrap_or_else(|e| Response::error(e.status(), e.to_string())),
            Ok(_) => Response::error(500, "Bridge not initialized"),
            Err(e) => Response::error(400, e.to_string()),
        };
        response.to_json().unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode response");
            br#"{"status":500,"headers":{},"body":""}"#.to_vec()
        })
    }

    /// HTML of `GET /`, or a fixed error page when that fails.
    pub async fn render_initial_page(&self) -> String {
        let response = self.handle_request_simple("GET", "/").await;
        if response.status >= 400 {
            warn!(status = response.status, "initial page failed to render");
            return ERROR_PAGE.to_owned();
        }
        response.body_str().into_owned()
    }

    // ── Channels ────────────────────────────────────────────────────────────

    /// Install the receiver for pushed envelopes. Applies to sessions
    /// connected afterwards.
    pub fn set_native_callback(&self, callback: Arc<dyn NativeCallback>) {
        *self.callback.write() = Some(callback);
    }

    /// Open a session for `url` and return its generated ID.
    pub async fn ws_connect(&self, url: &str) -> Result<SessionId> {
        let id = SessionId::new();
        self.ws_connect_with_id(id.clone(), url).await?;
        Ok(id)
    }

    /// Open a session for `url` under a host-chosen ID.
    pub async fn ws_connect_with_id(&self, id: SessionId, url: &str) -> Result<()> {
        let session = self.transport.connect_with_id(id, url).await?;
        self.attach(&session)
    }

    fn attach(&self, session: &Arc<Session>) -> Result<()> {
        let id = session.id().clone();
        let mailbox = session.take_mailbox().ok_or_else(|| TetherError::ChannelClosed {
            session_id: id.to_string(),
        })?;

        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => self.forwarders.spawn(forward(id, mailbox, callback)),
            None => {
                let _ = self
                    .parked
                    .lock()
                    .insert(id, Arc::new(tokio::sync::Mutex::new(mailbox)));
            }
        }
        Ok(())
    }

    /// Hand a client message (JSON) to the session's handler and return the
    /// reply envelope as JSON, if any.
    pub async fn ws_send(&self, id: &str, json: &str) -> Result<Option<String>> {
        match self.hub.handle_message(id, json.as_bytes()).await? {
            Some(reply) => reply.to_json().map(Some),
            None => Ok(None),
        }
    }

    /// Close a session. Unknown IDs are ignored.
    pub async fn ws_close(&self, id: &str) {
        self.hub.disconnect(id).await;
        let _ = self.parked.lock().remove(id);
    }

    fn parked(&self, id: &str) -> Option<ParkedMailbox> {
        self.parked.lock().get(id).cloned()
    }

    /// Forget a mailbox whose session closed and whose queue is drained.
    fn unpark(&self, id: &str) {
        if self.parked.lock().remove(id).is_some() {
            debug!(session_id = id, "parked mailbox drained and released");
        }
    }

    /// Next queued envelope as JSON, without waiting.
    ///
    /// Envelopes queued before the session closed stay readable; the first
    /// poll after the last one releases the mailbox. While a
    /// [`ws_poll_timeout`](Self::ws_poll_timeout) on the same session is
    /// waiting this returns `None`: the waiter owns the mailbox and takes the
    /// next envelope.
    pub fn ws_poll(&self, id: &str) -> Option<String> {
        let parked = self.parked(id)?;
        let mut mailbox = parked.try_lock().ok()?;
        match mailbox.try_recv() {
            Ok(envelope) => encode(id, &envelope),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.unpark(id);
                None
            }
        }
    }

    /// Next queued envelope as JSON, waiting up to `timeout`. A zero timeout
    /// behaves like [`ws_poll`](Self::ws_poll).
    pub async fn ws_poll_timeout(&self, id: &str, timeout: Duration) -> Option<String> {
        if timeout.is_zero() {
            return self.ws_poll(id);
        }
        let parked = self.parked(id)?;
        let received = tokio::time::timeout(timeout, async move {
            let mut mailbox = parked.lock().await;
            mailbox.recv().await
        })
        .await
        .ok()?;
        match received {
            Some(envelope) => encode(id, &envelope),
            None => {
                self.unpark(id);
                None
            }
        }
    }

    /// Send an HTML swap to every session whose path matches `url_pattern`.
    pub async fn broadcast(
        &self,
        url_pattern: &str,
        target: &str,
        html: &str,
    ) -> Result<BroadcastReport> {
        self.hub
            .broadcast_to_url(url_pattern, &html_envelope(target, html))
            .await
    }

    /// Send an HTML swap to every session.
    pub async fn broadcast_all(&self, target: &str, html: &str) -> Result<BroadcastReport> {
        self.hub.broadcast(&html_envelope(target, html)).await
    }

    /// Send an HTML swap to one session.
    pub fn send_to_session(&self, id: &str, target: &str, html: &str) -> Result<()> {
        self.hub.send(id, html_envelope(target, html))
    }

    /// Open sessions.
    pub fn session_count(&self) -> usize {
        self.hub.session_count()
    }

    /// Open sessions whose path matches `url_pattern`.
    pub fn session_count_for_url(&self, url_pattern: &str) -> usize {
        self.hub.sessions_for_url(url_pattern).len()
    }

    /// Stop the transport, close every session, and wait for forwarders.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self, timeout: Duration) {
        if let Err(e) = self.transport.stop(timeout).await {
            warn!(error = %e, "bridge transport stop failed");
        }
        let _ = self.forwarders.graceful_shutdown(timeout).await;
        self.parked.lock().clear();
        info!("bridge shut down");
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("ready", &self.is_ready())
            .field("sessions", &self.session_count())
            .field("parked", &self.parked.lock().len())
            .finish_non_exhaustive()
    }
}

fn html_envelope(target: &str, html: &str) -> Envelope {
    let envelope = Envelope::html(html);
    if target.is_empty() {
        envelope
    } else {
        envelope.with_target(target)
    }
}

fn encode(id: &str, envelope: &Envelope) -> Option<String> {
    match envelope.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(session_id = id, error = %e, "dropping unencodable envelope");
            None
        }
    }
}

async fn forward(id: SessionId, mut mailbox: Mailbox, callback: Arc<dyn NativeCallback>) {
    while let Some(envelope) = mailbox.recv().await {
        match envelope.to_json() {
            Ok(json) => callback.on_message(&id, &json),
            Err(e) => callback.on_error(&id, &e.to_string()),
        }
    }
    callback.on_close(&id, NORMAL_CLOSE, "Session closed");
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-global slot
// ─────────────────────────────────────────────────────────────────────────────

static GLOBAL: OnceLock<Arc<Bridge>> = OnceLock::new();

/// Publish `bridge` for native entry points that cannot carry a handle.
///
/// The first install wins; later calls return the installed bridge and drop
/// theirs.
pub fn install_global(bridge: Arc<Bridge>) -> Arc<Bridge> {
    GLOBAL.get_or_init(|| bridge).clone()
}

/// The installed global bridge.
pub fn global() -> Result<Arc<Bridge>> {
    GLOBAL.get().cloned().ok_or(TetherError::BridgeNotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use tether_hub::{Channel, ClientMessage, handler_fn};

    use crate::testing::TestClient;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "<h1>Home</h1>" }))
            .route(
                "/echo",
                post(|headers: HeaderMap, body: String| async move {
                    let tag = headers
                        .get("x-tag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_owned();
                    format!("{tag}:{body}")
                }),
            )
    }

    async fn ready_bridge() -> Bridge {
        let bridge = Bridge::new(&TetherSettings::default()).await.unwrap();
        bridge.set_handler(app());
        bridge.register_channel_handler(
            "/ws/counter",
            handler_fn(|_ch: Arc<dyn Channel>, msg: ClientMessage| async move {
                Ok::<_, TetherError>(Some(Envelope::reply(msg.request_id, "<span>1</span>")))
            }),
        );
        // Says goodbye, then hangs up.
        bridge.register_channel_handler(
            "/ws/bye",
            handler_fn(|ch: Arc<dyn Channel>, _msg: ClientMessage| async move {
                ch.send(Envelope::html("bye"))?;
                ch.close();
                Ok::<_, TetherError>(None)
            }),
        );
        bridge
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl NativeCallback for Recorder {
        fn on_message(&self, session_id: &str, json: &str) {
            let envelope = Envelope::from_json(json.as_bytes()).unwrap();
            self.events
                .lock()
                .push(format!("message:{session_id}:{}", envelope.payload));
        }

        fn on_close(&self, session_id: &str, code: u16, reason: &str) {
            self.events
                .lock()
                .push(format!("close:{session_id}:{code}:{reason}"));
        }

        fn on_error(&self, session_id: &str, message: &str) {
            self.events.lock().push(format!("error:{session_id}:{message}"));
        }
    }

    #[tokio::test]
    async fn not_ready_without_handler() {
        let bridge = Bridge::new(&TetherSettings::default()).await.unwrap();
        assert!(!bridge.is_ready());
        let resp = bridge.handle_request_simple("GET", "/").await;
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body_str(), "Bridge not initialized");
        assert_eq!(
            bridge.render_initial_page().await,
            "<html><body><h1>Error loading app</h1></body></html>"
        );
    }

    #[tokio::test]
    async fn handle_request_with_headers_and_body() {
        let bridge = ready_bridge().await;
        assert!(bridge.is_ready());
        let resp = bridge
            .handle_request("POST", "/echo", r#"{"X-Tag":"t1"}"#, b"hello")
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_str(), "t1:hello");

        let resp = bridge
            .handle_request("POST", "/echo", "not json", b"x")
            .await;
        assert_eq!(resp.body_str(), "-:x");
    }

    #[tokio::test]
    async fn bridge_matches_direct_adapter() {
        let bridge = ready_bridge().await;
        let direct = TestClient::new(app()).with_header("X-Tag", "t2");
        let expected = direct.post("/echo", "body").await.into_inner();
        let _ = direct.post("/echo", "body").await.assert_ok().assert_body("t2:body");

        let via_bridge = bridge
            .handle_request("POST", "/echo", r#"{"X-Tag":"t2"}"#, b"body")
            .await;
        assert_eq!(via_bridge, expected);
    }

    #[tokio::test]
    async fn render_initial_page_serves_root() {
        let bridge = ready_bridge().await;
        assert_eq!(bridge.render_initial_page().await, "<h1>Home</h1>");
    }

    #[tokio::test]
    async fn handle_request_json_round_trip() {
        let bridge = ready_bridge().await;
        let raw = bridge
            .handle_request_json(br#"{"method":"GET","url":"/","headers":"{}","body":""}"#)
            .await;
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["status"], 200);

        let raw = bridge.handle_request_json(b"{oops").await;
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["status"], 400);
    }

    #[tokio::test]
    async fn polling_without_callback() {
        let bridge = ready_bridge().await;
        let id = bridge.ws_connect("/ws/counter").await.unwrap();
        assert_eq!(bridge.session_count(), 1);
        assert_eq!(bridge.session_count_for_url("/ws/*"), 1);
        assert!(bridge.ws_poll(&id).is_none());

        bridge.send_to_session(&id, "#count", "<b>5</b>").unwrap();
        let json = bridge.ws_poll(&id).unwrap();
        let envelope = Envelope::from_json(json.as_bytes()).unwrap();
        assert_eq!(envelope.target.as_deref(), Some("#count"));
        assert_eq!(envelope.payload, "<b>5</b>");

        assert!(
            bridge
                .ws_poll_timeout(&id, Duration::from_millis(20))
                .await
                .is_none()
        );
        let report = bridge.broadcast_all("#all", "<i>hi</i>").await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(
            bridge
                .ws_poll_timeout(&id, Duration::from_secs(1))
                .await
                .is_some()
        );

        bridge.ws_close(&id).await;
        assert_eq!(bridge.session_count(), 0);
        assert!(bridge.ws_poll(&id).is_none());
    }

    #[tokio::test]
    async fn ws_send_returns_reply_json() {
        let bridge = ready_bridge().await;
        let id = bridge.ws_connect("/ws/counter").await.unwrap();
        let reply = bridge
            .ws_send(&id, r#"{"type":"request","request_id":"r9"}"#)
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::from_json(reply.as_bytes()).unwrap();
        assert_eq!(envelope.request_id.as_deref(), Some("r9"));

        assert_matches!(
            bridge.ws_send(&id, "{not json").await,
            Err(TetherError::MalformedMessage { .. })
        );
        assert_matches!(
            bridge.ws_send("ghost", "{}").await,
            Err(TetherError::UnknownSession { .. })
        );
    }

    #[tokio::test]
    async fn callback_receives_messages_and_close() {
        let bridge = ready_bridge().await;
        let recorder = Arc::new(Recorder::default());
        bridge.set_native_callback(recorder.clone());

        bridge
            .ws_connect_with_id(SessionId::from("native-1"), "/ws/counter")
            .await
            .unwrap();
        assert_matches!(
            bridge
                .ws_connect_with_id(SessionId::from("native-1"), "/ws/counter")
                .await,
            Err(TetherError::DuplicateSession { .. })
        );

        let report = bridge.broadcast("/ws/counter", "#c", "<b>2</b>").await.unwrap();
        assert_eq!(report.delivered, 1);
        bridge.ws_close("native-1").await;

        for _ in 0..100 {
            if recorder.events.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *recorder.events.lock(),
            vec![
                "message:native-1:<b>2</b>".to_owned(),
                "close:native-1:1000:Session closed".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn handler_close_releases_polled_session() {
        let bridge = ready_bridge().await;
        let id = bridge.ws_connect("/ws/bye").await.unwrap();
        assert!(bridge.ws_send(&id, "{}").await.unwrap().is_none());

        assert_eq!(bridge.session_count(), 0);
        assert_matches!(
            bridge.ws_send(&id, "{}").await,
            Err(TetherError::UnknownSession { .. })
        );
        // The goodbye queued before the close is still delivered.
        let json = bridge.ws_poll(&id).unwrap();
        assert_eq!(Envelope::from_json(json.as_bytes()).unwrap().payload, "bye");
        assert!(bridge.ws_poll(&id).is_none());
        assert!(bridge.parked.lock().is_empty());
    }

    #[tokio::test]
    async fn handler_close_released_by_timed_poll() {
        let bridge = ready_bridge().await;
        let id = bridge.ws_connect("/ws/bye").await.unwrap();
        let _ = bridge.ws_send(&id, "{}").await.unwrap();

        let wait = Duration::from_secs(1);
        assert!(bridge.ws_poll_timeout(&id, wait).await.is_some());
        assert!(bridge.ws_poll_timeout(&id, wait).await.is_none());
        assert!(bridge.parked.lock().is_empty());
    }

    #[tokio::test]
    async fn handler_close_reaches_native_callback() {
        let bridge = ready_bridge().await;
        let recorder = Arc::new(Recorder::default());
        bridge.set_native_callback(recorder.clone());
        bridge
            .ws_connect_with_id(SessionId::from("native-2"), "/ws/bye")
            .await
            .unwrap();
        let _ = bridge.ws_send("native-2", "{}").await.unwrap();
        assert_eq!(bridge.session_count(), 0);

        for _ in 0..100 {
            if recorder.events.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *recorder.events.lock(),
            vec![
                "message:native-2:bye".to_owned(),
                "close:native-2:1000:Session closed".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn timed_poll_owns_the_mailbox_while_waiting() {
        let bridge = Arc::new(ready_bridge().await);
        let id = bridge.ws_connect("/ws/counter").await.unwrap();

        let waiter = {
            let bridge = bridge.clone();
            let id = id.clone();
            tokio::spawn(async move { bridge.ws_poll_timeout(&id, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bridge.ws_poll(&id).is_none());

        bridge.send_to_session(&id, "#n", "<b>1</b>").unwrap();
        let json = waiter.await.unwrap().unwrap();
        assert_eq!(Envelope::from_json(json.as_bytes()).unwrap().payload, "<b>1</b>");
        assert!(bridge.ws_poll(&id).is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bridge = ready_bridge().await;
        let _id = bridge.ws_connect("/ws/counter").await.unwrap();
        bridge.shutdown(Duration::from_secs(1)).await;
        bridge.shutdown(Duration::from_secs(1)).await;
        assert_eq!(bridge.session_count(), 0);
        assert!(!bridge.is_ready());
        assert_eq!(bridge.handle_request_simple("GET", "/").await.status, 500);
        assert_matches!(
            bridge.ws_connect("/ws/counter").await,
            Err(TetherError::TransportClosed)
        );
    }

    #[tokio::test]
    async fn debug_output_summarises_state() {
        let bridge = ready_bridge().await;
        let _id = bridge.ws_connect("/ws/counter").await.unwrap();
        let rendered = format!("{bridge:?}");
        assert!(rendered.contains("ready: true"));
        assert!(rendered.contains("sessions: 1"));
    }

    #[tokio::test]
    async fn global_slot_first_install_wins() {
        assert_matches!(global(), Err(TetherError::BridgeNotInitialized));
        let first = Arc::new(ready_bridge().await);
        let second = Arc::new(ready_bridge().await);
        let installed = install_global(first.clone());
        assert!(Arc::ptr_eq(&installed, &first));
        let again = install_global(second);
        assert!(Arc::ptr_eq(&again, &first));
        assert!(Arc::ptr_eq(&global().unwrap(), &first));
    }
}
