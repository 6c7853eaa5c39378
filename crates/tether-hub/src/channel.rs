//! Transport-agnostic channel and handler contracts.
//!
//! Business logic is written against [`Channel`] and [`ChannelHandler`] only;
//! whether a channel is backed by a WebSocket or an in-process mailbox is not
//! observable here beyond metadata a transport chooses to set.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tether_core::{Result, SessionId};

use crate::message::{ClientMessage, Envelope};

/// The server end of a bidirectional channel, as seen by handlers.
pub trait Channel: Send + Sync {
    /// Session ID.
    fn id(&self) -> &SessionId;

    /// Path the channel was opened against (e.g. `/ws/chat`).
    fn path(&self) -> &str;

    /// Queue an envelope for the client without blocking.
    ///
    /// Fails with `ChannelFull` or `ChannelClosed`.
    fn send(&self, envelope: Envelope) -> Result<()>;

    /// Close the channel. The session leaves the hub and the handler's
    /// `on_close` runs. Closing twice is a no-op.
    fn close(&self);

    /// Whether the channel has been closed.
    fn is_closed(&self) -> bool;

    /// Resolves once the channel is closed.
    fn closed(&self) -> BoxFuture<'_, ()>;

    /// Store metadata on the channel.
    fn set(&self, key: &str, value: Value);

    /// Read metadata from the channel.
    fn get(&self, key: &str) -> Option<Value>;
}

/// Lifecycle and message callbacks for channels whose path matches a pattern.
///
/// Callbacks run outside every hub lock, so a handler may call back into the
/// hub (for example to broadcast).
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// A channel was opened. Returning an error refuses it; the session is
    /// never registered.
    async fn on_connect(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let _ = channel;
        Ok(())
    }

    /// A message arrived. `Ok(Some(envelope))` is queued back to the sender.
    async fn on_message(
        &self,
        channel: Arc<dyn Channel>,
        message: ClientMessage,
    ) -> Result<Option<Envelope>>;

    /// The channel was disconnected.
    async fn on_close(&self, channel: Arc<dyn Channel>) {
        let _ = channel;
    }
}

/// A [`ChannelHandler`] built from a message callback; connect and close are
/// no-ops.
pub struct MessageFn<F> {
    f: F,
}

/// Wrap an async closure as a [`ChannelHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<MessageFn<F>>
where
    F: Fn(Arc<dyn Channel>, ClientMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Envelope>>> + Send + 'static,
{
    Arc::new(MessageFn { f })
}

#[async_trait]
impl<F, Fut> ChannelHandler for MessageFn<F>
where
    F: Fn(Arc<dyn Channel>, ClientMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Envelope>>> + Send + 'static,
{
    async fn on_message(
        &self,
        channel: Arc<dyn Channel>,
        message: ClientMessage,
    ) -> Result<Option<Envelope>> {
        (self.f)(channel, message).await
    }
}
