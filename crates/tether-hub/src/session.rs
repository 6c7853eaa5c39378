//! Per-channel session state: identity, bounded outbound mailbox, metadata.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::{Result, SessionId, TetherError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::message::Envelope;

/// Receiving end of a session's outbound mailbox.
///
/// Yields queued envelopes in FIFO order and returns `None` once the session
/// is closed and the queue is drained.
pub type Mailbox = mpsc::Receiver<Envelope>;

/// Runs once, from the call that closes the session.
pub(crate) type ReleaseHook = Box<dyn FnOnce(&Session) + Send>;

/// Sending half of the mailbox and the hook that deregisters the session,
/// guarded together so a hook can never be installed on a closed session.
struct Outbox {
    /// `None` once closed; dropping the sender is what closes the mailbox.
    tx: Option<mpsc::Sender<Envelope>>,
    release: Option<ReleaseHook>,
}

/// One open channel registered with the hub.
pub struct Session {
    id: SessionId,
    path: String,
    outbox: Mutex<Outbox>,
    /// Taken exactly once by whichever task drains the mailbox.
    rx: Mutex<Option<Mailbox>>,
    closed: CancellationToken,
    metadata: Mutex<HashMap<String, Value>>,
    dropped_messages: AtomicU64,
    connected_at: Instant,
}

impl Session {
    /// Create a session with a mailbox of `capacity` envelopes.
    pub fn new(id: SessionId, path: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id,
            path: path.into(),
            outbox: Mutex::new(Outbox {
                tx: Some(tx),
                release: None,
            }),
            rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
            metadata: Mutex::new(HashMap::new()),
            dropped_messages: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    /// Session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Path the session was opened against.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Enqueue an envelope without blocking.
    ///
    /// Fails with [`TetherError::ChannelFull`] when the mailbox is at capacity
    /// (the envelope is dropped and counted) and with
    /// [`TetherError::ChannelClosed`] once the session is closed.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let outbox = self.outbox.lock();
        let Some(tx) = outbox.tx.as_ref() else {
            return Err(self.closed_error());
        };
        match tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(TetherError::ChannelFull {
                    session_id: self.id.to_string(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    /// Close the mailbox. Returns `true` only for the call that closed it.
    ///
    /// Envelopes already queued stay readable from the [`Mailbox`]. A
    /// registered session leaves the hub here, whoever closes it.
    pub fn close(&self) -> bool {
        let (was_open, release) = {
            let mut outbox = self.outbox.lock();
            (outbox.tx.take().is_some(), outbox.release.take())
        };
        self.closed.cancel();
        if let Some(release) = release {
            release(self);
        }
        was_open
    }

    /// Install the hook run on close. Fails once the session is closed.
    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) -> bool {
        let mut outbox = self.outbox.lock();
        if outbox.tx.is_none() {
            return false;
        }
        outbox.release = Some(hook);
        true
    }

    /// Whether the mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// A token cancelled when the session closes, for use in `select!`.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Take the receiving end of the mailbox. Only the first call gets it.
    pub fn take_mailbox(&self) -> Option<Mailbox> {
        self.rx.lock().take()
    }

    /// Store a metadata value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let _ = self.metadata.lock().insert(key.into(), value);
    }

    /// Read a metadata value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.metadata.lock().get(key).cloned()
    }

    /// Envelopes dropped because the mailbox was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    fn closed_error(&self) -> TetherError {
        TetherError::ChannelClosed {
            session_id: self.id.to_string(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}

impl Channel for Session {
    fn id(&self) -> &SessionId {
        Session::id(self)
    }

    fn path(&self) -> &str {
        Session::path(self)
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        Session::send(self, envelope)
    }

    fn close(&self) {
        let _ = Session::close(self);
    }

    fn is_closed(&self) -> bool {
        Session::is_closed(self)
    }

    fn closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(Session::closed(self))
    }

    fn set(&self, key: &str, value: Value) {
        Session::set(self, key, value);
    }

    fn get(&self, key: &str) -> Option<Value> {
        Session::get(self, key)
    }
}
