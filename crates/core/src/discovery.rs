//! Candidate discovery.
//!
//! Event-sourced candidates are deduplicated keeping each account's most
//! recent activity and ordered by `(block desc, log index desc, address asc)`.
//! Watch-list entries follow in their configured order. The combined list is
//! truncated to `max_users`, so the result is reproducible for a given log
//! window.

use alloy::primitives::Address;
use scanner_chain::{CandidateActivity, ChainError, DiscoveryMode, ProtocolAdapter};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

/// Configured discovery strategy of a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// Scan protocol event logs over the block window
    #[default]
    Events,
    /// Operator watch-list only
    Static,
}

/// Where the candidates of a cycle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Events,
    Static,
    /// Event logs followed by the watch-list
    Hybrid,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Static => "static",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Inclusive block range scanned for activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub from: u64,
    pub to: u64,
}

impl BlockWindow {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// The `lookback` blocks ending at `latest`.
    pub fn ending_at(latest: u64, lookback: u64) -> Self {
        Self {
            from: latest.saturating_sub(lookback.saturating_sub(1)),
            to: latest,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.from <= self.to
    }
}

/// Candidates selected for one protocol in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Accounts to evaluate, in order
    pub candidates: Vec<Address>,
    /// Distinct accounts before truncation
    pub candidates_seen: usize,
    pub source: DiscoverySource,
}

/// Deduplicate activity keeping each account's latest entry, most recent first.
pub fn order_by_recency(activity: &[CandidateActivity]) -> Vec<Address> {
    let mut latest: HashMap<Address, (u64, u64)> = HashMap::with_capacity(activity.len());
    for a in activity {
        let at = (a.block_number, a.log_index);
        latest
            .entry(a.user)
            .and_modify(|seen| {
                if at > *seen {
                    *seen = at;
                }
            })
            .or_insert(at);
    }

    let mut ordered: Vec<(Address, (u64, u64))> = latest.into_iter().collect();
    ordered.sort_by_key(|(user, (block, index))| (Reverse(*block), Reverse(*index), *user));
    ordered.into_iter().map(|(user, _)| user).collect()
}

/// Merge event-sourced and watch-list candidates and truncate.
pub fn select_candidates(
    event_sourced: Vec<Address>,
    watch_list: &[Address],
    max_users: usize,
    source: DiscoverySource,
) -> Discovered {
    let mut seen: HashSet<Address> = HashSet::with_capacity(event_sourced.len() + watch_list.len());
    let mut candidates = Vec::with_capacity(event_sourced.len() + watch_list.len());
    for user in event_sourced.into_iter().chain(watch_list.iter().copied()) {
        if user != Address::ZERO && seen.insert(user) {
            candidates.push(user);
        }
    }

    let candidates_seen = candidates.len();
    candidates.truncate(max_users);
    Discovered {
        candidates,
        candidates_seen,
        source,
    }
}

/// Run discovery for one protocol.
///
/// Adapters without an on-chain registry fall back to the watch-list; that
/// limitation is logged every cycle.
pub async fn discover(
    adapter: &dyn ProtocolAdapter,
    strategy: DiscoveryStrategy,
    watch_list: &[Address],
    window: BlockWindow,
    max_users: usize,
    timeout: Duration,
) -> Result<Discovered, ChainError> {
    let protocol = adapter.protocol_id();
    let use_events = match (strategy, adapter.discovery_mode()) {
        (DiscoveryStrategy::Static, _) => false,
        (DiscoveryStrategy::Events, DiscoveryMode::EventLogs) => true,
        (DiscoveryStrategy::Events, DiscoveryMode::StaticOnly) => {
            info!(
                protocol,
                watch_list = watch_list.len(),
                "Protocol has no enumerable registry, using watch-list only"
            );
            false
        }
    };

    if !use_events {
        return Ok(select_candidates(Vec::new(), watch_list, max_users, DiscoverySource::Static));
    }

    let activity = adapter.discover_candidates(window.from, window.to, timeout).await?;
    let event_sourced = order_by_recency(&activity);
    debug!(
        protocol,
        events = activity.len(),
        accounts = event_sourced.len(),
        from_block = window.from,
        to_block = window.to,
        "Event discovery finished"
    );

    let source = if watch_list.is_empty() {
        DiscoverySource::Events
    } else {
        DiscoverySource::Hybrid
    };
    Ok(select_candidates(event_sourced, watch_list, max_users, source))
}
