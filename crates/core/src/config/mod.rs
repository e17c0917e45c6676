//! Configuration for the position scanner.
//!
//! This module provides:
//! - Process settings (profiles, RPC access, scan timing, protocols, venues)
//! - Per-cycle scan options passed to `start_scan`
//! - Loading from TOML and the environment, and component wiring

mod loader;
mod scan;
mod settings;

pub use loader::{build_orchestrator, expand_env, load_settings, resolve, rpc_url, CONFIG_ENV, PROFILE_ENV};
pub use scan::ScanConfig;
pub use settings::{ProtocolEntry, RpcSettings, ScanSettings, ScannerSettings};
