//! Comptroller-fork adapter (Compound V2, Venus, and similar).
//!
//! Account health comes from `Comptroller.getAccountLiquidity`. The per-market
//! snapshots give the itemized lines and the exact borrow value, so the ratio
//! is not limited to the liquidity/shortfall sign.

use super::events::{self, collect_activity};
use super::{CandidateActivity, LiquidationTerms, LoadError, ProtocolAdapter, ProtocolKind};
use crate::port::{call_typed, ChainError, ChainReader, ReadOptions, RetryingReader};
use crate::types::{AssetBalance, HealthInput, RawHealthMetric, RawPosition, TokenAmount};
use alloy::primitives::{Address, U256};
use alloy::sol;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const MANTISSA_ONE: u128 = 1_000_000_000_000_000_000;

sol! {
    interface IComptroller {
        function getAllMarkets() external view returns (address[] memory markets);
        function getAssetsIn(address account) external view returns (address[] memory assets);
        function getAccountLiquidity(address account) external view returns (
            uint256 error,
            uint256 liquidity,
            uint256 shortfall
        );
        function markets(address cToken) external view returns (
            bool isListed,
            uint256 collateralFactorMantissa,
            bool isComped
        );
        function oracle() external view returns (address priceOracle);
    }

    interface ICToken {
        function getAccountSnapshot(address account) external view returns (
            uint256 error,
            uint256 cTokenBalance,
            uint256 borrowBalance,
            uint256 exchangeRateMantissa
        );
        function underlying() external view returns (address asset);
    }

    interface IPriceOracle {
        function getUnderlyingPrice(address cToken) external view returns (uint256 price);
    }

    interface IERC20Metadata {
        function decimals() external view returns (uint8 value);
    }
}

/// Configuration for a comptroller deployment.
#[derive(Debug, Clone)]
pub struct CompoundV2Config {
    /// Protocol identifier
    pub protocol_id: String,
    /// Comptroller (unitroller) address
    pub comptroller: Address,
    /// Oracle override; read from the comptroller when unset
    pub oracle: Option<Address>,
    /// Market whose underlying is the native coin (no `underlying()`)
    pub native_market: Option<Address>,
    /// Liquidation terms
    pub terms: LiquidationTerms,
}

/// Static market metadata, cached for the adapter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MarketMeta {
    underlying: Address,
    decimals: u8,
    collateral_factor_bps: u16,
}

/// Comptroller-fork adapter.
#[derive(Debug)]
pub struct CompoundV2Adapter {
    config: CompoundV2Config,
    reader: Arc<dyn ChainReader>,
    options: ReadOptions,
    oracle: OnceCell<Address>,
    markets: DashMap<Address, MarketMeta>,
}

impl CompoundV2Adapter {
    pub fn new(config: CompoundV2Config, reader: Arc<dyn ChainReader>, options: ReadOptions) -> Self {
        Self {
            config,
            reader: RetryingReader::wrap(reader, options.retry),
            options,
            oracle: OnceCell::new(),
            markets: DashMap::new(),
        }
    }

    async fn oracle(&self, timeout: Duration) -> Result<Address, ChainError> {
        if let Some(oracle) = self.config.oracle {
            return Ok(oracle);
        }
        self.oracle
            .get_or_try_init(|| async {
                let ret = call_typed(
                    self.reader.as_ref(),
                    self.config.comptroller,
                    &IComptroller::oracleCall {},
                    timeout,
                )
                .await?;
                Ok::<_, ChainError>(ret.priceOracle)
            })
            .await
            .copied()
    }

    async fn market_meta(&self, market: Address, timeout: Duration) -> Result<MarketMeta, ChainError> {
        if let Some(meta) = self.markets.get(&market) {
            return Ok(*meta);
        }

        let reader = self.reader.as_ref();
        let listing = call_typed(
            reader,
            self.config.comptroller,
            &IComptroller::marketsCall { cToken: market },
            timeout,
        )
        .await?;

        let (underlying, decimals) = if self.config.native_market == Some(market) {
            (Address::ZERO, 18)
        } else {
            let underlying = call_typed(reader, market, &ICToken::underlyingCall {}, timeout)
                .await?
                .asset;
            let decimals = call_typed(reader, underlying, &IERC20Metadata::decimalsCall {}, timeout)
                .await?
                .value;
            (underlying, decimals)
        };

        let meta = MarketMeta {
            underlying,
            decimals,
            collateral_factor_bps: mantissa_to_bps(listing.collateralFactorMantissa),
        };
        self.markets.insert(market, meta);
        debug!(market = %market, underlying = %underlying, decimals, "Cached market metadata");
        Ok(meta)
    }

    /// Collateral and debt lines for one market, plus the debt value (WAD USD).
    async fn market_lines(
        &self,
        market: Address,
        user: Address,
        oracle: Address,
        timeout: Duration,
    ) -> Result<(Option<AssetBalance>, Option<AssetBalance>, U256), ChainError> {
        let reader = self.reader.as_ref();
        let meta = self.market_meta(market, timeout).await?;
        let snapshot = call_typed(
            reader,
            market,
            &ICToken::getAccountSnapshotCall { account: user },
            timeout,
        )
        .await?;
        if !snapshot.error.is_zero() {
            return Err(ChainError::Revert(format!(
                "snapshot error code {} for market {}",
                snapshot.error, market
            )));
        }

        let price = call_typed(
            reader,
            oracle,
            &IPriceOracle::getUnderlyingPriceCall { cToken: market },
            timeout,
        )
        .await?
        .price;

        // Oracle prices are scaled so that raw_amount * price / 1e18 is USD (1e18).
        let price_decimals = 36u8.saturating_sub(meta.decimals);

        let supplied = underlying_balance(snapshot.cTokenBalance, snapshot.exchangeRateMantissa);
        let collateral = (!supplied.is_zero()).then(|| {
            AssetBalance::collateral(
                TokenAmount::new(meta.underlying, supplied, meta.decimals),
                price,
                price_decimals,
                meta.collateral_factor_bps,
            )
        });

        let borrowed = snapshot.borrowBalance;
        let debt = (!borrowed.is_zero()).then(|| {
            AssetBalance::debt(
                TokenAmount::new(meta.underlying, borrowed, meta.decimals),
                price,
                price_decimals,
            )
        });
        let debt_value = borrowed.saturating_mul(price) / U256::from(MANTISSA_ONE);

        Ok((collateral, debt, debt_value))
    }
}

fn underlying_balance(ctoken_balance: U256, exchange_rate: U256) -> U256 {
    ctoken_balance.saturating_mul(exchange_rate) / U256::from(MANTISSA_ONE)
}

fn mantissa_to_bps(mantissa: U256) -> u16 {
    (mantissa.saturating_mul(U256::from(10_000u64)) / U256::from(MANTISSA_ONE)).saturating_to::<u16>()
}

#[async_trait]
impl ProtocolAdapter for CompoundV2Adapter {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::CompoundV2
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ChainError> {
        call_typed(
            self.reader.as_ref(),
            self.config.comptroller,
            &IComptroller::getAllMarketsCall {},
            timeout,
        )
        .await
        .map(|_| ())
    }

    async fn discover_candidates(
        &self,
        from_block: u64,
        to_block: u64,
        timeout: Duration,
    ) -> Result<Vec<CandidateActivity>, ChainError> {
        let markets = call_typed(
            self.reader.as_ref(),
            self.config.comptroller,
            &IComptroller::getAllMarketsCall {},
            timeout,
        )
        .await?
        .markets;

        let discovery = events::compound_v2::discovery();
        let per_market = try_join_all(markets.iter().map(|market| {
            collect_activity(
                self.reader.as_ref(),
                *market,
                &discovery,
                from_block,
                to_block,
                timeout,
                self.options,
            )
        }))
        .await?;

        Ok(per_market.into_iter().flatten().collect())
    }

    async fn load_position(
        &self,
        user: Address,
        timeout: Duration,
    ) -> Result<RawPosition, LoadError> {
        let reader = self.reader.as_ref();
        let comptroller = self.config.comptroller;

        let account = call_typed(
            reader,
            comptroller,
            &IComptroller::getAccountLiquidityCall { account: user },
            timeout,
        )
        .await?;
        if !account.error.is_zero() {
            return Err(LoadError::Skipped(format!(
                "comptroller error code {}",
                account.error
            )));
        }

        let assets = call_typed(
            reader,
            comptroller,
            &IComptroller::getAssetsInCall { account: user },
            timeout,
        )
        .await?
        .assets;

        if assets.is_empty() && account.liquidity.is_zero() && account.shortfall.is_zero() {
            return Err(LoadError::Skipped("empty account".to_string()));
        }

        let mut collateral = SmallVec::new();
        let mut debt = SmallVec::new();
        let mut debt_value = Some(U256::ZERO);

        match self.oracle(timeout).await {
            Ok(oracle) => {
                let lines = join_all(
                    assets
                        .iter()
                        .map(|market| self.market_lines(*market, user, oracle, timeout)),
                )
                .await;
                for (market, line) in assets.iter().zip(lines) {
                    match line {
                        Ok((c, d, value)) => {
                            collateral.extend(c);
                            debt.extend(d);
                            debt_value = debt_value.map(|total| total.saturating_add(value));
                        }
                        Err(e) if e.is_systemic() => return Err(LoadError::SourceUnavailable(e)),
                        Err(e) => {
                            warn!(user = %user, market = %market, error = %e, "Market snapshot unavailable");
                            debt_value = None;
                        }
                    }
                }
            }
            Err(e) if e.is_systemic() => return Err(LoadError::SourceUnavailable(e)),
            Err(e) => {
                warn!(protocol = self.protocol_id(), error = %e, "Price oracle unavailable");
                debt_value = None;
            }
        }

        Ok(RawPosition {
            protocol: self.config.protocol_id.clone(),
            user,
            collateral,
            debt,
            health: HealthInput::LiquidityShortfall {
                liquidity: account.liquidity,
                shortfall: account.shortfall,
                debt_value,
            },
            raw_health_metric: RawHealthMetric::LiquidityShortfall {
                liquidity: account.liquidity,
                shortfall: account.shortfall,
            },
            block_number: 0,
        })
    }

    fn liquidation_terms(&self) -> LiquidationTerms {
        self.config.terms
    }
}
