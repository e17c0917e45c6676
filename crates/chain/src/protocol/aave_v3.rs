//! AAVE V3 adapter.
//!
//! Reads account totals from `Pool.getUserAccountData` and, when a balances
//! reader is deployed next to the pool, the per-token supplied and borrowed
//! balances. Works for AAVE V3 and forks sharing the pool interface.

use super::events::{self, collect_activity};
use super::{CandidateActivity, LiquidationTerms, LoadError, ProtocolAdapter, ProtocolKind};
use crate::port::{call_typed, ChainError, ChainReader, ReadOptions, RetryingReader};
use crate::types::{AssetBalance, HealthInput, RawHealthMetric, RawPosition, TokenAmount};
use alloy::primitives::{Address, U256};
use alloy::sol;
use async_trait::async_trait;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Base currency and balances-reader prices use 8 decimals.
const BASE_CURRENCY_DECIMALS: u8 = 8;

sol! {
    interface IPool {
        function getUserAccountData(address user) external view returns (
            uint256 totalCollateralBase,
            uint256 totalDebtBase,
            uint256 availableBorrowsBase,
            uint256 currentLiquidationThreshold,
            uint256 ltv,
            uint256 healthFactor
        );

        function getReservesList() external view returns (address[] memory reserves);
    }

    /// Balance entry from BalancesReader
    #[derive(Debug)]
    struct BalanceEntry {
        address underlying;
        uint256 amount;
        uint256 price;
        uint256 decimals;
    }

    interface IBalancesReader {
        function getAllSuppliedBalancesWithPrices(address pool, address user)
            external view returns (BalanceEntry[] memory entries);

        function getAllBorrowedBalancesWithPrices(address pool, address user)
            external view returns (BalanceEntry[] memory entries);
    }
}

/// Configuration for an AAVE V3 deployment.
#[derive(Debug, Clone)]
pub struct AaveV3Config {
    /// Protocol identifier
    pub protocol_id: String,
    /// Pool contract address
    pub pool_address: Address,
    /// Balances reader contract address (optional)
    pub balances_reader_address: Option<Address>,
    /// Liquidation terms
    pub terms: LiquidationTerms,
}

impl Default for AaveV3Config {
    fn default() -> Self {
        Self {
            protocol_id: "aave-v3".to_string(),
            pool_address: Address::ZERO,
            balances_reader_address: None,
            terms: LiquidationTerms::default(),
        }
    }
}

/// AAVE V3 adapter.
#[derive(Debug)]
pub struct AaveV3Adapter {
    config: AaveV3Config,
    reader: Arc<dyn ChainReader>,
    options: ReadOptions,
}

impl AaveV3Adapter {
    pub fn new(config: AaveV3Config, reader: Arc<dyn ChainReader>, options: ReadOptions) -> Self {
        Self {
            config,
            reader: RetryingReader::wrap(reader, options.retry),
            options,
        }
    }

    /// Per-token supplied and borrowed lines, if a balances reader exists.
    ///
    /// Failures only cost the itemized view; health comes from the totals.
    async fn load_balances(
        &self,
        user: Address,
        liquidation_threshold_bps: u16,
        timeout: Duration,
    ) -> Result<(SmallVec<[AssetBalance; 4]>, SmallVec<[AssetBalance; 4]>), LoadError> {
        let Some(balances_reader) = self.config.balances_reader_address else {
            return Ok((SmallVec::new(), SmallVec::new()));
        };
        let pool = self.config.pool_address;
        let reader = self.reader.as_ref();

        let supply_call = IBalancesReader::getAllSuppliedBalancesWithPricesCall { pool, user };
        let borrow_call = IBalancesReader::getAllBorrowedBalancesWithPricesCall { pool, user };

        let (supply_result, borrow_result) = tokio::join!(
            call_typed(reader, balances_reader, &supply_call, timeout),
            call_typed(reader, balances_reader, &borrow_call, timeout)
        );

        let supplied = match supply_result {
            Ok(ret) => ret.entries,
            Err(e) if e.is_systemic() => return Err(LoadError::SourceUnavailable(e)),
            Err(e) => {
                warn!(user = %user, error = %e, "Failed to fetch supply balances");
                Vec::new()
            }
        };
        let borrowed = match borrow_result {
            Ok(ret) => ret.entries,
            Err(e) if e.is_systemic() => return Err(LoadError::SourceUnavailable(e)),
            Err(e) => {
                warn!(user = %user, error = %e, "Failed to fetch borrow balances");
                Vec::new()
            }
        };

        let collateral = supplied
            .iter()
            .filter(|b| !b.amount.is_zero())
            .map(|b| {
                AssetBalance::collateral(
                    token_amount(b),
                    b.price,
                    BASE_CURRENCY_DECIMALS,
                    liquidation_threshold_bps,
                )
            })
            .collect();
        let debt = borrowed
            .iter()
            .filter(|b| !b.amount.is_zero())
            .map(|b| AssetBalance::debt(token_amount(b), b.price, BASE_CURRENCY_DECIMALS))
            .collect();

        Ok((collateral, debt))
    }
}

fn token_amount(entry: &BalanceEntry) -> TokenAmount {
    TokenAmount::new(
        entry.underlying,
        entry.amount,
        entry.decimals.saturating_to::<u8>(),
    )
}

/// Clamp a bps value reported as uint256.
fn bps(value: U256) -> u16 {
    value.saturating_to::<u16>()
}

#[async_trait]
impl ProtocolAdapter for AaveV3Adapter {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::AaveV3
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ChainError> {
        let reserves = call_typed(
            self.reader.as_ref(),
            self.config.pool_address,
            &IPool::getReservesListCall {},
            timeout,
        )
        .await?;
        debug!(
            protocol = self.protocol_id(),
            reserves = reserves.reserves.len(),
            "Pool reachable"
        );
        Ok(())
    }

    async fn discover_candidates(
        &self,
        from_block: u64,
        to_block: u64,
        timeout: Duration,
    ) -> Result<Vec<CandidateActivity>, ChainError> {
        collect_activity(
            self.reader.as_ref(),
            self.config.pool_address,
            &events::aave_v3::discovery(),
            from_block,
            to_block,
            timeout,
            self.options,
        )
        .await
    }

    async fn load_position(
        &self,
        user: Address,
        timeout: Duration,
    ) -> Result<RawPosition, LoadError> {
        debug!(user = %user, protocol = self.protocol_id(), "Fetching position");

        let account = call_typed(
            self.reader.as_ref(),
            self.config.pool_address,
            &IPool::getUserAccountDataCall { user },
            timeout,
        )
        .await?;

        if account.totalCollateralBase.is_zero() && account.totalDebtBase.is_zero() {
            return Err(LoadError::Skipped("empty account".to_string()));
        }

        let threshold = bps(account.currentLiquidationThreshold);
        let (collateral, debt) = self.load_balances(user, threshold, timeout).await?;

        Ok(RawPosition {
            protocol: self.config.protocol_id.clone(),
            user,
            collateral,
            debt,
            health: HealthInput::Totals {
                collateral_value: account.totalCollateralBase,
                debt_value: account.totalDebtBase,
                liquidation_threshold_bps: threshold,
                value_decimals: BASE_CURRENCY_DECIMALS,
            },
            raw_health_metric: RawHealthMetric::ScaledRatio {
                value: account.healthFactor,
                decimals: 18,
            },
            block_number: 0,
        })
    }

    fn liquidation_terms(&self) -> LiquidationTerms {
        self.config.terms
    }
}
