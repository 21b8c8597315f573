//! # vepline-settings
//!
//! Settings are assembled from three layers, lowest priority first:
//! compiled defaults, an optional JSON file, and `VEPLINE_*` environment
//! variables. The resulting [`Settings`] value is built once at startup and
//! handed to each component explicitly.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
