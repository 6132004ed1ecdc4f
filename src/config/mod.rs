//! Node Configuration Module
//!
//! Provides per-node configuration loaded from TOML files, covering every
//! tunable the control plane recognises (raft timing, RPC policy, broadcast
//! caps, scan intervals, autoscale bounds).
//!
//! ## Loading Order
//!
//! 1. `SKYMESH_CONFIG` environment variable (path to TOML file)
//! 2. `skymesh.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(NodeConfig::load());
//!
//! // Anywhere in the codebase:
//! let timeout = config::get().rpc.timeout();
//! ```

mod node_config;

pub use node_config::*;

use std::sync::OnceLock;

/// Global node configuration, initialized once at startup.
static NODE_CONFIG: OnceLock<NodeConfig> = OnceLock::new();

/// Initialize the global node configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: NodeConfig) {
    if NODE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global node configuration.
///
/// Falls back to defaults when `init()` has not run, which keeps unit tests
/// independent of startup ordering.
pub fn get() -> &'static NodeConfig {
    NODE_CONFIG.get_or_init(NodeConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    NODE_CONFIG.get().is_some()
}
