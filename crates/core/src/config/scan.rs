//! Per-cycle scan configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::discovery::BlockWindow;
use crate::error::ScanError;
use crate::ranker::RankingPolicy;

pub(crate) fn default_concurrency() -> usize {
    16
}

pub(crate) fn default_grace_ms() -> u64 {
    250
}

/// Options of one `start_scan` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Protocol identifiers to include
    pub protocols: BTreeSet<String>,
    /// Candidate cap per protocol
    pub max_users_per_protocol: usize,
    /// Block range for event discovery
    pub block_window: BlockWindow,
    /// Venue identifiers to quote with (empty = no quoting)
    pub venues: BTreeSet<String>,
    /// Timeout of every chain read and venue quote
    pub per_call_timeout_ms: u64,
    /// Soft deadline of each protocol task
    pub per_protocol_deadline_ms: u64,
    /// Concurrent evaluations per protocol
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Extra time after the deadline before remaining tasks are aborted
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default)]
    pub ranking_policy: RankingPolicy,
}

impl ScanConfig {
    /// Check the options on their own. Protocol and venue ids are checked
    /// against the registered components by the orchestrator.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.protocols.is_empty() {
            return Err(ScanError::config("at least one protocol is required"));
        }
        if self.max_users_per_protocol == 0 {
            return Err(ScanError::config("max_users_per_protocol must be positive"));
        }
        if !self.block_window.is_valid() {
            return Err(ScanError::config(format!(
                "block window {}..{} is empty",
                self.block_window.from, self.block_window.to
            )));
        }
        if self.per_call_timeout_ms == 0 {
            return Err(ScanError::config("per_call_timeout_ms must be positive"));
        }
        if self.per_protocol_deadline_ms == 0 {
            return Err(ScanError::config("per_protocol_deadline_ms must be positive"));
        }
        if self.concurrency == 0 {
            return Err(ScanError::config("concurrency must be positive"));
        }
        Ok(())
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    pub fn per_protocol_deadline(&self) -> Duration {
        Duration::from_millis(self.per_protocol_deadline_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ScanConfig {
        ScanConfig {
            protocols: BTreeSet::from(["aave-v3".to_string()]),
            max_users_per_protocol: 100,
            block_window: BlockWindow::new(1, 10),
            venues: BTreeSet::new(),
            per_call_timeout_ms: 1_000,
            per_protocol_deadline_ms: 10_000,
            concurrency: default_concurrency(),
            grace_ms: default_grace_ms(),
            ranking_policy: RankingPolicy::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_fields() {
        let cases = [
            ScanConfig {
                protocols: BTreeSet::new(),
                ..valid()
            },
            ScanConfig {
                max_users_per_protocol: 0,
                ..valid()
            },
            ScanConfig {
                block_window: BlockWindow::new(10, 1),
                ..valid()
            },
            ScanConfig {
                per_call_timeout_ms: 0,
                ..valid()
            },
            ScanConfig {
                per_protocol_deadline_ms: 0,
                ..valid()
            },
            ScanConfig {
                concurrency: 0,
                ..valid()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));
        }
    }

    #[test]
    fn test_defaults_from_json() {
        let config: ScanConfig = serde_json::from_str(
            r#"{
                "protocols": ["aave-v3"],
                "max_users_per_protocol": 50,
                "block_window": {"from": 1, "to": 2},
                "venues": [],
                "per_call_timeout_ms": 500,
                "per_protocol_deadline_ms": 5000
            }"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.grace_ms, 250);
        assert_eq!(config.ranking_policy, RankingPolicy::RatioFirst);
    }
}
