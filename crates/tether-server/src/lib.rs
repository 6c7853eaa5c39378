//! # tether-server
//!
//! Drives an application's HTTP router and channel handlers through one of
//! two interchangeable transports.
//!
//! - [`VirtualHttpAdapter`]: runs a structured [`Request`](tether_core::Request)
//!   through an axum `Router` in memory and captures the response
//! - [`LoopbackTransport`]: real TCP listener on `127.0.0.1` guarded by a
//!   per-launch secret, origin allow-list, and CORS
//! - [`InProcessTransport`]: direct calls into the adapter and hub, no sockets
//! - [`Bridge`]: native-host entry points layered over the in-process transport
//! - [`TestClient`](testing::TestClient): route tests over the adapter, with
//!   htmx helpers and response assertions
//! - Graceful shutdown via `CancellationToken` with a forced-abort deadline

#![deny(unsafe_code)]

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod health;
pub mod security;
pub mod shutdown;
pub mod testing;
pub mod transport;

pub use adapter::VirtualHttpAdapter;
pub use bridge::{Bridge, NativeCallback, global, install_global};
pub use config::TransportConfig;
pub use health::{HealthResponse, health_check};
pub use security::{SECRET_HEADER, SECRET_QUERY_PARAM, SESSION_HEADER, generate_secret};
pub use shutdown::ShutdownCoordinator;
pub use transport::{
    ClientChannel, InProcessTransport, LoopbackTransport, Transport, build_transport,
};
