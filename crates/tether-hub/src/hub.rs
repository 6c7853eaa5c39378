//! The session hub: registry, pattern dispatch, and delivery.
//!
//! The registry and the handler table sit behind independent locks. Neither
//! lock is held across a handler callback or an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use tether_core::telemetry::{
    MAILBOX_DROPS_TOTAL, MESSAGES_DISPATCHED_TOTAL, SESSIONS_ACTIVE, SESSIONS_CONNECTED_TOTAL,
    SESSIONS_DISCONNECTED_TOTAL, SESSIONS_REJECTED_TOTAL,
};
use tether_core::{Result, SessionId, TetherError};
use tether_settings::{HubSettings, SlowConsumerPolicy};
use tracing::{debug, info, warn};

use crate::channel::ChannelHandler;
use crate::message::{ClientMessage, Envelope};
use crate::session::{ReleaseHook, Session};

type HandlerRef = Arc<dyn ChannelHandler>;
type Registry = RwLock<HashMap<SessionId, Arc<Session>>>;

#[derive(Default)]
struct HandlerTable {
    /// Checked in registration order; first match wins.
    routes: Vec<(String, HandlerRef)>,
    fallback: Option<HandlerRef>,
}

impl HandlerTable {
    fn resolve(&self, path: &str) -> Option<HandlerRef> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, path))
            .map(|(_, handler)| handler.clone())
            .or_else(|| self.fallback.clone())
    }
}

/// Outcome of a broadcast fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the envelope was queued for.
    pub delivered: usize,
    /// Sessions skipped because their mailbox was full.
    pub dropped: usize,
    /// Sessions skipped because they were closing.
    pub closed: usize,
}

impl BroadcastReport {
    /// Sessions targeted by the broadcast.
    pub fn total(&self) -> usize {
        self.delivered + self.dropped + self.closed
    }
}

/// Multiplexes every open channel of one application instance.
pub struct Hub {
    sessions: Arc<Registry>,
    handlers: RwLock<HandlerTable>,
    closed: AtomicBool,
    settings: HubSettings,
}

impl Hub {
    /// Create an empty hub.
    pub fn new(settings: HubSettings) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            handlers: RwLock::new(HandlerTable::default()),
            closed: AtomicBool::new(false),
            settings,
        }
    }

    /// Hub settings.
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    // ── Handler table ───────────────────────────────────────────────

    /// Register a handler for sessions whose path matches `pattern`.
    ///
    /// A pattern matches a path when equal to it, or when the pattern ends in
    /// `/` or `*` and the path starts with the part before the `*`.
    /// Registering the same pattern again replaces its handler in place.
    pub fn register_handler(&self, pattern: impl Into<String>, handler: Arc<dyn ChannelHandler>) {
        let pattern = pattern.into();
        let mut table = self.handlers.write();
        if let Some(slot) = table.routes.iter_mut().find(|(p, _)| *p == pattern) {
            slot.1 = handler;
        } else {
            debug!(pattern, "channel handler registered");
            table.routes.push((pattern, handler));
        }
    }

    /// Set the handler used when no pattern matches.
    pub fn set_default_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.handlers.write().fallback = Some(handler);
    }

    fn resolve(&self, path: &str) -> Option<HandlerRef> {
        self.handlers.read().resolve(path)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open a session on `path` under a fresh ID.
    pub async fn connect(&self, path: &str) -> Result<Arc<Session>> {
        self.connect_with_id(SessionId::new(), path).await
    }

    /// Open a session on `path` under a caller-supplied ID.
    ///
    /// The resolved handler's `on_connect` runs before the session becomes
    /// visible; if it fails, or closes the session, the session is never
    /// registered. Once registered, closing the session from any side
    /// removes it from the hub.
    pub async fn connect_with_id(&self, id: SessionId, path: &str) -> Result<Arc<Session>> {
        self.ensure_open()?;
        if self.sessions.read().contains_key(&id) {
            return Err(TetherError::DuplicateSession {
                session_id: id.into_inner(),
            });
        }

        let session = Arc::new(Session::new(id, path, self.settings.mailbox_capacity));
        let handler = self.resolve(path);

        if let Some(handler) = &handler {
            if let Err(e) = handler.on_connect(session.clone()).await {
                let _ = session.close();
                counter!(SESSIONS_REJECTED_TOTAL).increment(1);
                warn!(session_id = %session.id(), path, error = %e, "connect rejected by handler");
                return Err(e);
            }
        }

        let registered = {
            let mut sessions = self.sessions.write();
            if self.is_closed() {
                Err(TetherError::HubClosed)
            } else if sessions.contains_key(session.id()) {
                Err(TetherError::DuplicateSession {
                    session_id: session.id().to_string(),
                })
            } else if session.set_release_hook(self.release_hook(handler.clone())) {
                let _ = sessions.insert(session.id().clone(), session.clone());
                Ok(sessions.len())
            } else {
                Err(TetherError::ChannelClosed {
                    session_id: session.id().to_string(),
                })
            }
        };

        match registered {
            Ok(active) => {
                counter!(SESSIONS_CONNECTED_TOTAL).increment(1);
                gauge!(SESSIONS_ACTIVE).increment(1.0);
                info!(session_id = %session.id(), path, active, "session connected");
                Ok(session)
            }
            Err(e) => {
                // Lost a race with close() or a concurrent connect of the same
                // ID, or the handler closed the channel during on_connect.
                let _ = session.close();
                if let Some(handler) = handler {
                    handler.on_close(session.clone()).await;
                }
                Err(e)
            }
        }
    }

    /// Remove a session, close its mailbox, and run its handler's `on_close`.
    ///
    /// Unknown IDs (including already-disconnected ones) are a no-op.
    pub async fn disconnect(&self, id: &str) {
        let removed = {
            let mut sessions = self.sessions.write();
            sessions.remove(id).map(|s| (s, sessions.len()))
        };
        let Some((session, active)) = removed else {
            return;
        };
        let _ = session.close();

        counter!(SESSIONS_DISCONNECTED_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).decrement(1.0);
        info!(
            session_id = id,
            path = session.path(),
            dropped = session.drop_count(),
            active,
            "session disconnected"
        );

        if let Some(handler) = self.resolve(session.path()) {
            handler.on_close(session).await;
        }
    }

    /// Deregistration for a session closed through its own handle (a handler
    /// calling `Channel::close`). Removes the entry only while it is still
    /// this session; `on_close` runs on the current runtime.
    fn release_hook(&self, handler: Option<HandlerRef>) -> ReleaseHook {
        let registry = Arc::downgrade(&self.sessions);
        Box::new(move |closing: &Session| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = {
                let mut sessions = registry.write();
                let current = sessions
                    .get(closing.id())
                    .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), closing));
                if current {
                    sessions.remove(closing.id()).map(|s| (s, sessions.len()))
                } else {
                    None
                }
            };
            let Some((session, active)) = removed else {
                return;
            };

            counter!(SESSIONS_DISCONNECTED_TOTAL).increment(1);
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
            info!(
                session_id = %session.id(),
                path = session.path(),
                active,
                "session closed by its channel"
            );

            let Some(handler) = handler else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let _ = runtime.spawn(async move { handler.on_close(session).await });
                }
                Err(_) => debug!(session_id = %session.id(), "no runtime, on_close skipped"),
            }
        })
    }

    /// Disconnect every session. Later operations fail with
    /// [`TetherError::HubClosed`]. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        info!(sessions = drained.len(), "hub closing");

        for session in drained {
            let _ = session.close();
            counter!(SESSIONS_DISCONNECTED_TOTAL).increment(1);
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
            if let Some(handler) = self.resolve(session.path()) {
                handler.on_close(session).await;
            }
        }
    }

    /// Whether [`Hub::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TetherError::HubClosed)
        } else {
            Ok(())
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Parse a raw inbound frame and dispatch it to the session's handler.
    pub async fn handle_message(&self, id: &str, raw: &[u8]) -> Result<Option<Envelope>> {
        self.ensure_open()?;
        let message = ClientMessage::parse(raw)?;
        self.dispatch(id, message).await
    }

    /// Dispatch an already-parsed message to the session's handler.
    ///
    /// Returns the handler's reply without queueing it; the caller decides
    /// whether it goes to the mailbox.
    pub async fn dispatch(&self, id: &str, message: ClientMessage) -> Result<Option<Envelope>> {
        self.ensure_open()?;
        let session = self.session(id).ok_or_else(|| TetherError::UnknownSession {
            session_id: id.to_owned(),
        })?;
        let handler = self
            .resolve(session.path())
            .ok_or_else(|| TetherError::NoHandler {
                path: session.path().to_owned(),
            })?;

        counter!(MESSAGES_DISPATCHED_TOTAL).increment(1);
        debug!(
            session_id = id,
            kind = %message.kind,
            request_id = %message.request_id,
            "dispatching channel message"
        );
        handler.on_message(session, message).await
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Queue an envelope for one session without blocking.
    pub fn send(&self, id: &str, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        let session = self.session(id).ok_or_else(|| TetherError::UnknownSession {
            session_id: id.to_owned(),
        })?;
        let result = session.send(envelope);
        if let Err(TetherError::ChannelFull { .. }) = &result {
            counter!(MAILBOX_DROPS_TOTAL, "kind" => "direct").increment(1);
            warn!(session_id = id, "mailbox full, message dropped");
        }
        result
    }

    /// Queue an envelope for every session.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<BroadcastReport> {
        self.ensure_open()?;
        let targets: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        Ok(self.fan_out(targets, envelope).await)
    }

    /// Queue an envelope for every session whose path matches `pattern`.
    pub async fn broadcast_to_url(
        &self,
        pattern: &str,
        envelope: &Envelope,
    ) -> Result<BroadcastReport> {
        self.ensure_open()?;
        let targets = self.sessions_for_url(pattern);
        Ok(self.fan_out(targets, envelope).await)
    }

    /// Deliver to each target independently; a full or closing mailbox never
    /// affects the others.
    async fn fan_out(&self, targets: Vec<Arc<Session>>, envelope: &Envelope) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut slow = Vec::new();

        for session in targets {
            match session.send(envelope.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TetherError::ChannelFull { .. }) => {
                    report.dropped += 1;
                    counter!(MAILBOX_DROPS_TOTAL, "kind" => "broadcast").increment(1);
                    warn!(session_id = %session.id(), "mailbox full, broadcast dropped");
                    slow.push(session.id().clone());
                }
                Err(_) => report.closed += 1,
            }
        }

        if self.settings.slow_consumer == SlowConsumerPolicy::Disconnect {
            for id in slow {
                warn!(session_id = %id, "disconnecting slow consumer");
                self.disconnect(&id).await;
            }
        }

        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            closed = report.closed,
            "broadcast complete"
        );
        report
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Look up a registered session.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Registered sessions whose path matches `pattern`.
    pub fn sessions_for_url(&self, pattern: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| pattern_matches(pattern, s.path()))
            .cloned()
            .collect()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}

/// Exact match, or prefix match for patterns ending in `/` or `*`.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    pattern.ends_with('/') && path.starts_with(pattern)
}
