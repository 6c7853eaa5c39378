//! # tether-core
//!
//! Foundation types shared by every tether crate.
//!
//! - **Structured request/response**: [`Request`] and [`Response`], the plain-data
//!   shapes exchanged between a native bridge and the processing core
//! - **Errors**: [`TetherError`] taxonomy via `thiserror`, with stable wire codes
//! - **Branded IDs**: [`SessionId`] newtype for channel sessions
//! - **Logging**: `tracing` subscriber bootstrap and test log capture
//! - **Telemetry**: metric names shared by the hub and transports

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod request;
pub mod telemetry;

pub use errors::{Result, TetherError};
pub use ids::SessionId;
pub use request::{Request, Response, canonical_header_key};
