//! Compound V3 (Comet) adapter.
//!
//! A Comet market has one borrowable base asset and a fixed list of
//! collateral assets. The asset list is static per deployment and is read
//! once; balances and prices are read per position.

use super::events::{self, collect_activity};
use super::{CandidateActivity, LiquidationTerms, LoadError, ProtocolAdapter, ProtocolKind};
use crate::port::{call_typed, ChainError, ChainReader, ReadOptions, RetryingReader};
use crate::types::{AssetBalance, HealthInput, RawHealthMetric, RawPosition, TokenAmount};
use alloy::primitives::{Address, U256};
use alloy::sol;
use async_trait::async_trait;
use futures::future::try_join_all;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// Comet price feeds report 8 decimals.
const PRICE_DECIMALS: u8 = 8;
const FACTOR_SCALE: u128 = 1_000_000_000_000_000_000;

sol! {
    struct AssetInfo {
        uint8 offset;
        address asset;
        address priceFeed;
        uint64 scale;
        uint64 borrowCollateralFactor;
        uint64 liquidateCollateralFactor;
        uint64 liquidationFactor;
        uint128 supplyCap;
    }

    interface IComet {
        function baseToken() external view returns (address token);
        function baseTokenPriceFeed() external view returns (address feed);
        function decimals() external view returns (uint8 value);
        function numAssets() external view returns (uint8 count);
        function getAssetInfo(uint8 i) external view returns (AssetInfo memory info);
        function collateralBalanceOf(address account, address asset) external view returns (uint128 balance);
        function borrowBalanceOf(address account) external view returns (uint256 balance);
        function getPrice(address priceFeed) external view returns (uint256 price);
        function isLiquidatable(address account) external view returns (bool liquidatable);
    }
}

/// Configuration for a Comet market.
#[derive(Debug, Clone)]
pub struct CometConfig {
    /// Protocol identifier
    pub protocol_id: String,
    /// Comet proxy address
    pub comet: Address,
    /// Liquidation terms
    pub terms: LiquidationTerms,
}

#[derive(Debug, Clone)]
struct CollateralAsset {
    asset: Address,
    price_feed: Address,
    decimals: u8,
    liquidation_threshold_bps: u16,
}

#[derive(Debug, Clone)]
struct MarketLayout {
    base_token: Address,
    base_price_feed: Address,
    base_decimals: u8,
    collaterals: Vec<CollateralAsset>,
}

/// Compound V3 adapter.
#[derive(Debug)]
pub struct CometAdapter {
    config: CometConfig,
    reader: Arc<dyn ChainReader>,
    options: ReadOptions,
    layout: OnceCell<MarketLayout>,
}

impl CometAdapter {
    pub fn new(config: CometConfig, reader: Arc<dyn ChainReader>, options: ReadOptions) -> Self {
        Self {
            config,
            reader: RetryingReader::wrap(reader, options.retry),
            options,
            layout: OnceCell::new(),
        }
    }

    async fn layout(&self, timeout: Duration) -> Result<&MarketLayout, ChainError> {
        self.layout
            .get_or_try_init(|| self.read_layout(timeout))
            .await
    }

    async fn read_layout(&self, timeout: Duration) -> Result<MarketLayout, ChainError> {
        let reader = self.reader.as_ref();
        let comet = self.config.comet;

        let base_token = call_typed(reader, comet, &IComet::baseTokenCall {}, timeout)
            .await?
            .token;
        let base_price_feed = call_typed(reader, comet, &IComet::baseTokenPriceFeedCall {}, timeout)
            .await?
            .feed;
        let base_decimals = call_typed(reader, comet, &IComet::decimalsCall {}, timeout)
            .await?
            .value;
        let count = call_typed(reader, comet, &IComet::numAssetsCall {}, timeout)
            .await?
            .count;

        let infos = try_join_all(
            (0..count).map(|i| async move {
                call_typed(reader, comet, &IComet::getAssetInfoCall { i }, timeout).await
            }),
        )
        .await?;

        let collaterals = infos
            .into_iter()
            .map(|ret| CollateralAsset {
                asset: ret.info.asset,
                price_feed: ret.info.priceFeed,
                decimals: scale_to_decimals(ret.info.scale),
                liquidation_threshold_bps: factor_to_bps(ret.info.liquidateCollateralFactor),
            })
            .collect::<Vec<_>>();

        debug!(
            protocol = %self.config.protocol_id,
            base = %base_token,
            collaterals = collaterals.len(),
            "Loaded Comet market layout"
        );

        Ok(MarketLayout {
            base_token,
            base_price_feed,
            base_decimals,
            collaterals,
        })
    }

    async fn price(&self, feed: Address, timeout: Duration) -> Result<U256, ChainError> {
        Ok(call_typed(
            self.reader.as_ref(),
            self.config.comet,
            &IComet::getPriceCall { priceFeed: feed },
            timeout,
        )
        .await?
        .price)
    }
}

/// `scale` is `10^decimals`.
fn scale_to_decimals(mut scale: u64) -> u8 {
    let mut decimals = 0u8;
    while scale >= 10 {
        scale /= 10;
        decimals += 1;
    }
    decimals
}

fn factor_to_bps(factor: u64) -> u16 {
    ((factor as u128) * 10_000 / FACTOR_SCALE).min(u16::MAX as u128) as u16
}

#[async_trait]
impl ProtocolAdapter for CometAdapter {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Comet
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ChainError> {
        call_typed(
            self.reader.as_ref(),
            self.config.comet,
            &IComet::baseTokenCall {},
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
        collect_activity(
            self.reader.as_ref(),
            self.config.comet,
            &events::comet::discovery(),
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
        let reader = self.reader.as_ref();
        let comet = self.config.comet;
        let layout = self.layout(timeout).await?;

        let borrowed = call_typed(reader, comet, &IComet::borrowBalanceOfCall { account: user }, timeout)
            .await?
            .balance;

        let balances = try_join_all(layout.collaterals.iter().map(|c| async move {
            let call = IComet::collateralBalanceOfCall {
                account: user,
                asset: c.asset,
            };
            call_typed(reader, comet, &call, timeout).await
        }))
        .await?;

        let held: Vec<(&CollateralAsset, U256)> = layout
            .collaterals
            .iter()
            .zip(balances)
            .map(|(c, ret)| (c, U256::from(ret.balance)))
            .filter(|(_, amount)| !amount.is_zero())
            .collect();

        if borrowed.is_zero() && held.is_empty() {
            return Err(LoadError::Skipped("empty account".to_string()));
        }

        let prices = try_join_all(held.iter().map(|(c, _)| self.price(c.price_feed, timeout))).await?;
        let collateral: SmallVec<[AssetBalance; 4]> = held
            .iter()
            .zip(prices)
            .map(|((c, amount), price)| {
                AssetBalance::collateral(
                    TokenAmount::new(c.asset, *amount, c.decimals),
                    price,
                    PRICE_DECIMALS,
                    c.liquidation_threshold_bps,
                )
            })
            .collect();

        let mut debt = SmallVec::new();
        if !borrowed.is_zero() {
            let base_price = self.price(layout.base_price_feed, timeout).await?;
            debt.push(AssetBalance::debt(
                TokenAmount::new(layout.base_token, borrowed, layout.base_decimals),
                base_price,
                PRICE_DECIMALS,
            ));
        }

        let liquidatable = call_typed(reader, comet, &IComet::isLiquidatableCall { account: user }, timeout)
            .await?
            .liquidatable;

        Ok(RawPosition {
            protocol: self.config.protocol_id.clone(),
            user,
            collateral,
            debt,
            health: HealthInput::Itemized,
            raw_health_metric: RawHealthMetric::Flag { liquidatable },
            block_number: 0,
        })
    }

    fn liquidation_terms(&self) -> LiquidationTerms {
        self.config.terms
    }
}
