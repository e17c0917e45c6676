//! Scanner settings with profile support.
//!
//! Provides the process-level configuration: RPC access, scan timing and
//! limits, the protocol deployments to scan and the swap venues to quote
//! with. Profiles (default, testing, production) preset the timing and limit
//! sections.

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use scanner_api::VenueSpec;
use scanner_chain::protocol::parse_address;
use scanner_chain::{ProtocolSpec, ReadOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use super::scan::{default_concurrency, default_grace_ms, ScanConfig};
use crate::discovery::{BlockWindow, DiscoveryStrategy};
use crate::ranker::RankingPolicy;

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Chain access
    #[serde(default)]
    pub rpc: RpcSettings,

    /// Scan timing and limits
    #[serde(default)]
    pub scan: ScanSettings,

    /// Lending protocol deployments (`[[protocol]]` tables)
    #[serde(default, rename = "protocol", skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<ProtocolEntry>,

    /// Swap venues (`[[venue]]` tables)
    #[serde(default, rename = "venue", skip_serializing_if = "Vec::is_empty")]
    pub venues: Vec<VenueSpec>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// JSON-RPC access settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSettings {
    /// HTTP endpoint; `${VAR}` references are expanded
    #[serde(default = "default_rpc_url")]
    pub url: String,

    /// Attempts per read on timeouts and transport errors
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay between attempts (milliseconds)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Maximum blocks per `eth_getLogs` request
    #[serde(default = "default_log_chunk_blocks")]
    pub log_chunk_blocks: u64,
}

fn default_rpc_url() -> String {
    "${RPC_URL}".to_string()
}
fn default_retries() -> u32 {
    2
}
fn default_retry_backoff() -> u64 {
    200
}
fn default_log_chunk_blocks() -> u64 {
    2_000
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff(),
            log_chunk_blocks: default_log_chunk_blocks(),
        }
    }
}

impl RpcSettings {
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            log_chunk_blocks: self.log_chunk_blocks.max(1),
            retry: RetryPolicy::new(self.retries, Duration::from_millis(self.retry_backoff_ms)),
        }
    }
}

/// Scan cycle timing and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Interval between periodic cycles (seconds)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Blocks ending at the chain head scanned for activity
    #[serde(default = "default_lookback")]
    pub lookback_blocks: u64,

    /// Candidate cap per protocol
    #[serde(default = "default_max_users")]
    pub max_users_per_protocol: usize,

    /// Timeout of every chain read and venue quote (milliseconds)
    #[serde(default = "default_call_timeout")]
    pub per_call_timeout_ms: u64,

    /// Soft deadline of each protocol task (milliseconds)
    #[serde(default = "default_protocol_deadline")]
    pub per_protocol_deadline_ms: u64,

    /// Concurrent evaluations per protocol
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Grace period after the deadline (milliseconds)
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    #[serde(default)]
    pub ranking_policy: RankingPolicy,
}

fn default_interval() -> u64 {
    60
}
fn default_lookback() -> u64 {
    5_000
}
fn default_max_users() -> usize {
    200
}
fn default_call_timeout() -> u64 {
    3_000
}
fn default_protocol_deadline() -> u64 {
    30_000
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            lookback_blocks: default_lookback(),
            max_users_per_protocol: default_max_users(),
            per_call_timeout_ms: default_call_timeout(),
            per_protocol_deadline_ms: default_protocol_deadline(),
            concurrency: default_concurrency(),
            grace_ms: default_grace_ms(),
            ranking_policy: RankingPolicy::default(),
        }
    }
}

impl ScanSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_enabled() -> bool {
    true
}

/// One protocol deployment plus how its candidates are found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEntry {
    #[serde(flatten)]
    pub spec: ProtocolSpec,

    #[serde(default)]
    pub discovery: DiscoveryStrategy,

    /// Accounts always evaluated, after event-sourced ones
    #[serde(default)]
    pub watch_list: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProtocolEntry {
    pub fn watch_list_addresses(&self) -> Result<Vec<Address>> {
        self.watch_list
            .iter()
            .map(|s| parse_address(s))
            .collect::<Result<_>>()
            .with_context(|| format!("Protocol '{}' watch_list", self.spec.id))
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            rpc: RpcSettings::default(),
            scan: ScanSettings::default(),
            protocols: Vec::new(),
            venues: Vec::new(),
        }
    }
}

impl ScannerSettings {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file {}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Short cycles against small windows, for local runs.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            rpc: RpcSettings {
                retries: 1,
                ..RpcSettings::default()
            },
            scan: ScanSettings {
                interval_secs: 15,
                lookback_blocks: 500,
                max_users_per_protocol: 25,
                per_call_timeout_ms: 5_000,
                per_protocol_deadline_ms: 20_000,
                concurrency: 4,
                grace_ms: 500,
                ranking_policy: RankingPolicy::RatioFirst,
            },
            ..Self::default()
        }
    }

    /// Wide windows and higher concurrency.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            rpc: RpcSettings {
                retries: 3,
                retry_backoff_ms: 250,
                ..RpcSettings::default()
            },
            scan: ScanSettings {
                interval_secs: 30,
                lookback_blocks: 50_000,
                max_users_per_protocol: 1_000,
                per_call_timeout_ms: 2_000,
                per_protocol_deadline_ms: 45_000,
                concurrency: 20,
                grace_ms: 250,
                ranking_policy: RankingPolicy::RatioFirst,
            },
            ..Self::default()
        }
    }

    /// Preset by name. Supported values: default, testing, production.
    pub fn profile(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "default" => Some(Self::default()),
            "testing" | "test" => Some(Self::testing()),
            "production" | "prod" => Some(Self::production()),
            _ => None,
        }
    }

    /// Check ids and addresses before anything is built.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for entry in &self.protocols {
            if !ids.insert(entry.spec.id.as_str()) {
                bail!("Duplicate protocol id '{}'", entry.spec.id);
            }
            entry.watch_list_addresses()?;
        }
        let mut venue_ids = HashSet::new();
        for venue in &self.venues {
            if !venue_ids.insert(venue.id.as_str()) {
                bail!("Duplicate venue id '{}'", venue.id);
            }
        }
        if self.scan.max_users_per_protocol == 0 {
            bail!("scan.max_users_per_protocol must be positive");
        }
        Ok(())
    }

    /// Enabled protocol ids.
    pub fn enabled_protocols(&self) -> BTreeSet<String> {
        self.protocols
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.spec.id.clone())
            .collect()
    }

    /// Cycle options covering every enabled protocol and every venue.
    pub fn scan_config(&self, block_window: BlockWindow) -> ScanConfig {
        ScanConfig {
            protocols: self.enabled_protocols(),
            max_users_per_protocol: self.scan.max_users_per_protocol,
            block_window,
            venues: self.venues.iter().map(|v| v.id.clone()).collect(),
            per_call_timeout_ms: self.scan.per_call_timeout_ms,
            per_protocol_deadline_ms: self.scan.per_protocol_deadline_ms,
            concurrency: self.scan.concurrency,
            grace_ms: self.scan.grace_ms,
            ranking_policy: self.scan.ranking_policy,
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Scanner configuration loaded");
        tracing::info!(
            retries = self.rpc.retries,
            retry_backoff_ms = self.rpc.retry_backoff_ms,
            log_chunk_blocks = self.rpc.log_chunk_blocks,
            "RPC settings"
        );
        tracing::info!(
            interval_secs = self.scan.interval_secs,
            lookback_blocks = self.scan.lookback_blocks,
            max_users = self.scan.max_users_per_protocol,
            call_timeout_ms = self.scan.per_call_timeout_ms,
            deadline_ms = self.scan.per_protocol_deadline_ms,
            concurrency = self.scan.concurrency,
            ranking = ?self.scan.ranking_policy,
            "Scan settings"
        );
        for entry in &self.protocols {
            tracing::info!(
                protocol = %entry.spec.id,
                kind = %entry.spec.kind,
                discovery = ?entry.discovery,
                watch_list = entry.watch_list.len(),
                enabled = entry.enabled,
                "Protocol"
            );
        }
        for venue in &self.venues {
            tracing::info!(venue = %venue.id, kind = %venue.kind, "Venue");
        }
    }
}
