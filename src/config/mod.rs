//! Client configuration loaded from TOML files.
//!
//! ## Loading Order
//!
//! 1. `OPSLEDGER_CONFIG` environment variable (path to TOML file)
//! 2. `opsledger.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(ClientConfig::load());
//!
//! // Anywhere in the codebase:
//! let workers = config::get().writer.workers;
//! ```

mod client_config;
pub mod defaults;

pub use client_config::*;

use std::sync::OnceLock;

/// Global client configuration, initialized once at startup.
static CLIENT_CONFIG: OnceLock<ClientConfig> = OnceLock::new();

/// Initialize the global client configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: ClientConfig) {
    if CLIENT_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global client configuration.
///
/// Panics if `init()` has not been called: a missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static ClientConfig {
    CLIENT_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    CLIENT_CONFIG.get().is_some()
}
