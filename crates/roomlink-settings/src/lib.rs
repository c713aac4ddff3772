//! # roomlink-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RoomlinkSettings::default()`]
//! 2. **User file**: `~/.roomlink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ROOMLINK_*` overrides (highest priority)
//!
//! Exchange names are part of the wire contract and deliberately absent.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{BrokerSettings, LoggingSettings, RoomlinkSettings, ServerSettings};
