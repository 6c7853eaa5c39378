//! # tether-settings
//!
//! Configuration for the tether transports and session hub.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use tether_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("transport mode: {:?}", settings.transport.mode);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::*;
