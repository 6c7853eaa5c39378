//! # tether-hub
//!
//! The session hub multiplexes every open bidirectional channel of an
//! application instance.
//!
//! - **Wire model**: [`Envelope`] (server → client) and [`ClientMessage`]
//!   (client → server)
//! - **Contracts**: [`Channel`] and [`ChannelHandler`], the transport-agnostic
//!   surface business logic is written against
//! - **Sessions**: [`Session`] with a bounded, non-blocking outbound mailbox
//! - **Hub**: registry, pattern dispatch, point-to-point and broadcast delivery

#![deny(unsafe_code)]

pub mod channel;
pub mod hub;
pub mod message;
pub mod session;

pub use channel::{Channel, ChannelHandler, MessageFn, handler_fn};
pub use hub::{BroadcastReport, Hub, pattern_matches};
pub use message::{ClientMessage, DEFAULT_CHANNEL, Envelope, Format, swap};
pub use session::{Mailbox, Session};
