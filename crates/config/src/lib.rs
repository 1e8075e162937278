//! Configuration for docket.
//!
//! [`Settings`] is the single persisted settings object. It is loaded through
//! a [`SettingsSource`] (usually a [`Loader`]) every time the organizer needs
//! it, so edits to the configuration file or a rotated API token take effect
//! without restarting the process.

pub mod error;
mod loader;
mod settings;

pub use crate::loader::{ENV_PREFIX, Loader, SettingsSource};
pub use crate::settings::{
    DEFAULT_JOURNAL_FILE, DEFAULT_LAYOUT, DEFAULT_TICKET_PATTERN, MAX_RESOLVE_RETRIES, Secret, Settings, Stability,
};
