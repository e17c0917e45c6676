//! Vat-style CDP adapter (Maker and forks).
//!
//! A vault's health is `ink * spot` against `art * rate`, both in RAD. The
//! liquidation ratio is already folded into `spot`, so that product is the
//! threshold-adjusted collateral; market value multiplies the ratio back in.
//! The Vat keeps no enumerable owner registry, so this adapter only scans
//! operator-supplied urns.

use super::{
    CandidateActivity, DiscoveryMode, LiquidationTerms, LoadError, ProtocolAdapter, ProtocolKind,
};
use crate::port::{call_typed, ChainError, ChainReader, ReadOptions, RetryingReader};
use crate::types::{AssetBalance, HealthInput, RawHealthMetric, RawPosition, TokenAmount};
use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use async_trait::async_trait;
use futures::future::try_join_all;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const RAY_DECIMALS: u8 = 27;
/// RAD values (1e45)
const RAD_DECIMALS: u8 = 45;

sol! {
    interface IVat {
        function live() external view returns (uint256 status);
        function urns(bytes32 ilk, address urn) external view returns (uint256 ink, uint256 art);
        function ilks(bytes32 ilk) external view returns (
            uint256 Art,
            uint256 rate,
            uint256 spot,
            uint256 line,
            uint256 dust
        );
    }
}

/// One collateral type of the vault engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdpVault {
    /// Collateral type name (e.g. "ETH-A")
    pub ilk: String,
    /// Collateral token
    pub collateral_token: Address,
    /// Liquidation ratio in bps (15000 = 150%)
    pub liquidation_ratio_bps: u16,
}

impl CdpVault {
    /// Ilk name as a right-padded `bytes32`.
    pub fn ilk_id(&self) -> B256 {
        let mut id = [0u8; 32];
        let name = self.ilk.as_bytes();
        let len = name.len().min(32);
        id[..len].copy_from_slice(&name[..len]);
        B256::from(id)
    }
}

/// Configuration for a vault engine.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Protocol identifier
    pub protocol_id: String,
    /// Vat address
    pub vat: Address,
    /// Stablecoin minted against the vaults
    pub stablecoin: Address,
    /// Collateral types scanned for each urn
    pub vaults: Vec<CdpVault>,
    /// Liquidation terms
    pub terms: LiquidationTerms,
}

/// Vat-style CDP adapter.
#[derive(Debug)]
pub struct CdpAdapter {
    config: CdpConfig,
    reader: Arc<dyn ChainReader>,
}

impl CdpAdapter {
    pub fn new(config: CdpConfig, reader: Arc<dyn ChainReader>, options: ReadOptions) -> Self {
        Self {
            config,
            reader: RetryingReader::wrap(reader, options.retry),
        }
    }
}

/// Market price of one collateral unit (RAY) from the liquidation-adjusted spot.
fn market_price(spot: U256, liquidation_ratio_bps: u16) -> U256 {
    spot.saturating_mul(U256::from(liquidation_ratio_bps)) / U256::from(10_000u64)
}

#[async_trait]
impl ProtocolAdapter for CdpAdapter {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Cdp
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::StaticOnly
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ChainError> {
        let live = call_typed(self.reader.as_ref(), self.config.vat, &IVat::liveCall {}, timeout)
            .await?
            .status;
        if live.is_zero() {
            return Err(ChainError::Revert("vat is caged".to_string()));
        }
        Ok(())
    }

    async fn discover_candidates(
        &self,
        _from_block: u64,
        _to_block: u64,
        _timeout: Duration,
    ) -> Result<Vec<CandidateActivity>, ChainError> {
        debug!(
            protocol = self.protocol_id(),
            "Vault engine has no owner registry; relying on watch-list"
        );
        Ok(Vec::new())
    }

    async fn load_position(
        &self,
        user: Address,
        timeout: Duration,
    ) -> Result<RawPosition, LoadError> {
        let reader = self.reader.as_ref();
        let vat = self.config.vat;

        let per_vault = try_join_all(self.config.vaults.iter().map(|vault| async move {
            let ilk = vault.ilk_id();
            let urn = call_typed(reader, vat, &IVat::urnsCall { ilk, urn: user }, timeout).await?;
            if urn.ink.is_zero() && urn.art.is_zero() {
                return Ok::<_, ChainError>(None);
            }
            let params = call_typed(reader, vat, &IVat::ilksCall { ilk }, timeout).await?;
            Ok(Some((vault, urn.ink, urn.art, params.rate, params.spot)))
        }))
        .await?;

        let mut collateral = SmallVec::new();
        let mut debt = SmallVec::new();
        let mut collateral_value = U256::ZERO;
        let mut adjusted_collateral_value = U256::ZERO;
        let mut debt_value = U256::ZERO;

        for (vault, ink, art, rate, spot) in per_vault.into_iter().flatten() {
            let price = market_price(spot, vault.liquidation_ratio_bps);
            collateral_value = collateral_value.saturating_add(ink.saturating_mul(price));
            adjusted_collateral_value = adjusted_collateral_value.saturating_add(ink.saturating_mul(spot));
            let owed = art.saturating_mul(rate);
            debt_value = debt_value.saturating_add(owed);

            if !ink.is_zero() {
                collateral.push(AssetBalance::collateral(
                    TokenAmount::new(vault.collateral_token, ink, 18),
                    price,
                    RAY_DECIMALS,
                    (100_000_000u32 / u32::from(vault.liquidation_ratio_bps.max(1))).min(10_000) as u16,
                ));
            }
            if !owed.is_zero() {
                // Stablecoin debt in WAD, priced at par.
                let amount = owed / U256::from(10u64).pow(U256::from(RAY_DECIMALS));
                debt.push(AssetBalance::debt(
                    TokenAmount::new(self.config.stablecoin, amount, 18),
                    U256::from(1u64),
                    0,
                ));
            }
        }

        if collateral_value.is_zero() && debt_value.is_zero() {
            return Err(LoadError::Skipped("no open vaults".to_string()));
        }

        Ok(RawPosition {
            protocol: self.config.protocol_id.clone(),
            user,
            collateral,
            debt,
            health: HealthInput::AdjustedTotals {
                collateral_value,
                adjusted_collateral_value,
                debt_value,
                value_decimals: RAD_DECIMALS,
            },
            raw_health_metric: RawHealthMetric::Collateralization {
                collateral: adjusted_collateral_value,
                debt: debt_value,
            },
            block_number: 0,
        })
    }

    fn liquidation_terms(&self) -> LiquidationTerms {
        self.config.terms
    }
}
