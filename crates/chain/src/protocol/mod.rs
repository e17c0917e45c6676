//! Protocol abstraction layer for multi-protocol scanning.
//!
//! Every lending protocol is read through a [`ProtocolAdapter`] which turns
//! protocol-specific contract state into a [`RawPosition`]. The scanner never
//! branches on the concrete protocol: adding a protocol means adding an
//! adapter and registering it in the [`ProtocolFactory`].
//!
//! # Example
//!
//! ```rust,ignore
//! use scanner_chain::protocol::{ProtocolAdapter, ProtocolFactory, ProtocolSpec};
//!
//! let adapter = ProtocolFactory::new(reader).build(&spec)?;
//!
//! adapter.probe(timeout).await?;
//! let activity = adapter.discover_candidates(from, to, timeout).await?;
//! for candidate in activity {
//!     let position = adapter.load_position(candidate.user, timeout).await;
//! }
//! ```

#[cfg(feature = "aave-v3")]
mod aave_v3;
#[cfg(feature = "cdp")]
mod cdp;
#[cfg(feature = "compound-v3")]
mod comet;
#[cfg(feature = "compound-v2")]
mod compound_v2;
pub mod events;
mod factory;

#[cfg(feature = "aave-v3")]
pub use aave_v3::{AaveV3Adapter, AaveV3Config};
#[cfg(feature = "cdp")]
pub use cdp::{CdpAdapter, CdpConfig, CdpVault};
#[cfg(feature = "compound-v3")]
pub use comet::{CometAdapter, CometConfig};
#[cfg(feature = "compound-v2")]
pub use compound_v2::{CompoundV2Adapter, CompoundV2Config};
pub use factory::{parse_address, ProtocolFactory, ProtocolSpec, VaultSpec};

use crate::port::ChainError;
use crate::types::RawPosition;
use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// AAVE V3 and forks
    AaveV3,
    /// Comptroller-based forks (Compound V2, Venus, ...)
    CompoundV2,
    /// Compound V3 (Comet)
    Comet,
    /// Vat-style collateralized debt positions
    Cdp,
}

impl ProtocolKind {
    /// Parse from a config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "aave-v3" | "aavev3" | "aave_v3" => Some(Self::AaveV3),
            "compound-v2" | "compoundv2" | "compound_v2" | "comptroller" => Some(Self::CompoundV2),
            "compound-v3" | "compoundv3" | "compound_v3" | "comet" => Some(Self::Comet),
            "cdp" | "vat" | "maker" => Some(Self::Cdp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AaveV3 => "aave-v3",
            Self::CompoundV2 => "compound-v2",
            Self::Comet => "comet",
            Self::Cdp => "cdp",
        }
    }
}

/// How an adapter can find candidate accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Candidates come from protocol event logs.
    EventLogs,
    /// No cheap on-chain registry; only an operator watch-list works.
    StaticOnly,
}

/// One observed interaction of an account with a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandidateActivity {
    pub user: Address,
    pub block_number: u64,
    pub log_index: u64,
}

/// Why a position could not be loaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The address failed on its own (revert, malformed data, protocol error
    /// code). Other candidates are unaffected.
    #[error("position skipped: {0}")]
    Skipped(String),
    /// The protocol source is unreachable.
    #[error("source unavailable: {0}")]
    SourceUnavailable(ChainError),
}

impl From<ChainError> for LoadError {
    fn from(err: ChainError) -> Self {
        if err.is_systemic() {
            Self::SourceUnavailable(err)
        } else {
            Self::Skipped(err.to_string())
        }
    }
}

/// Liquidation parameters used to estimate extractable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTerms {
    /// Share of the debt repayable in one liquidation (bps)
    pub close_factor_bps: u16,
    /// Collateral bonus paid to the liquidator (bps)
    pub liquidation_bonus_bps: u16,
}

impl Default for LiquidationTerms {
    fn default() -> Self {
        Self {
            close_factor_bps: 5000,
            liquidation_bonus_bps: 500,
        }
    }
}

/// Read access to one lending protocol deployment.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + Debug {
    /// Deployment identifier (e.g., "aave-v3-mainnet").
    fn protocol_id(&self) -> &str;

    /// Protocol family.
    fn kind(&self) -> ProtocolKind;

    /// How candidates can be discovered.
    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::EventLogs
    }

    /// One cheap read against the core contract. An error means the source is
    /// unavailable for this cycle.
    async fn probe(&self, timeout: Duration) -> Result<(), ChainError>;

    /// Accounts that interacted with the protocol in the block window.
    ///
    /// `StaticOnly` adapters return an empty list.
    async fn discover_candidates(
        &self,
        from_block: u64,
        to_block: u64,
        timeout: Duration,
    ) -> Result<Vec<CandidateActivity>, ChainError>;

    /// Load one account's position.
    async fn load_position(&self, user: Address, timeout: Duration)
        -> Result<RawPosition, LoadError>;

    /// Liquidation parameters for value estimates.
    fn liquidation_terms(&self) -> LiquidationTerms;
}
