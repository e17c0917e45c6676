//! Uniswap V3 venue.
//!
//! Quotes through QuoterV2 over the configured fee tiers. Two-hop routes go
//! through connector tokens leg by leg, each leg at its best tier. The best
//! tier per pair is cached.

use super::{QuotePath, QuoteRequest, SwapVenue, VenueError};
use alloy::primitives::{aliases::U24, Address, U160, U256};
use alloy::sol;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use scanner_chain::{call_typed, ChainReader};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

sol! {
    interface IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }

        function quoteExactInputSingle(QuoteExactInputSingleParams memory params)
            external
            returns (
                uint256 amountOut,
                uint160 sqrtPriceX96After,
                uint32 initializedTicksCrossed,
                uint256 gasEstimate
            );
    }
}

/// Common Uniswap V3 fee tiers in hundredths of a basis point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeTier {
    /// 0.01% - Ultra stable pairs (e.g., USDC/USDT)
    Lowest = 100,
    /// 0.05% - Stable pairs
    Low = 500,
    /// 0.3% - Standard pairs
    Medium = 3000,
    /// 1% - Exotic pairs
    High = 10000,
}

impl FeeTier {
    /// Fee tiers to try, ordered by likelihood for the given token types.
    pub fn tiers_for_pair(is_stable_pair: bool) -> Vec<u32> {
        if is_stable_pair {
            vec![100, 500, 3000]
        } else {
            vec![3000, 500, 10000, 100]
        }
    }
}

/// Uniswap V3 QuoterV2 venue.
#[derive(Debug)]
pub struct UniswapV3Venue {
    id: String,
    quoter: Address,
    reader: Arc<dyn ChainReader>,
    /// Intermediate tokens for two-hop routes
    connectors: Vec<Address>,
    /// Known stablecoins (for fee tier selection)
    stablecoins: Vec<Address>,
    /// Best fee tier per ordered pair
    fee_cache: DashMap<(Address, Address), u32>,
}

impl UniswapV3Venue {
    pub fn new(id: impl Into<String>, quoter: Address, reader: Arc<dyn ChainReader>) -> Self {
        Self {
            id: id.into(),
            quoter,
            reader,
            connectors: Vec::new(),
            stablecoins: Vec::new(),
            fee_cache: DashMap::new(),
        }
    }

    pub fn with_connectors(mut self, connectors: Vec<Address>) -> Self {
        self.connectors = connectors;
        self
    }

    /// Add known stablecoin addresses for better fee tier selection.
    pub fn with_stablecoins(mut self, stablecoins: Vec<Address>) -> Self {
        self.stablecoins = stablecoins;
        self
    }

    fn is_stable_pair(&self, token_in: &Address, token_out: &Address) -> bool {
        self.stablecoins.contains(token_in) && self.stablecoins.contains(token_out)
    }

    async fn quote_single(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee: u32,
        timeout: Duration,
    ) -> Result<U256, VenueError> {
        let call = IQuoterV2::quoteExactInputSingleCall {
            params: IQuoterV2::QuoteExactInputSingleParams {
                tokenIn: token_in,
                tokenOut: token_out,
                amountIn: amount_in,
                fee: U24::from(fee),
                sqrtPriceLimitX96: U160::ZERO,
            },
        };
        let ret = call_typed(self.reader.as_ref(), self.quoter, &call, timeout).await?;
        Ok(ret.amountOut)
    }

    /// Best single-hop output for a pair, trying the cached tier first.
    async fn best_single(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        timeout: Duration,
    ) -> Result<U256, VenueError> {
        if let Some(fee) = self.fee_cache.get(&(token_in, token_out)).map(|f| *f) {
            match self.quote_single(token_in, token_out, amount_in, fee, timeout).await {
                Ok(out) if !out.is_zero() => return Ok(out),
                Ok(_) | Err(VenueError::NoRoute) => {
                    debug!(fee, "Cached fee tier no longer quotes, rescanning");
                    self.fee_cache.remove(&(token_in, token_out));
                }
                Err(e) => return Err(e),
            }
        }

        let tiers = FeeTier::tiers_for_pair(self.is_stable_pair(&token_in, &token_out));
        let quotes = join_all(
            tiers
                .iter()
                .map(|fee| self.quote_single(token_in, token_out, amount_in, *fee, timeout)),
        )
        .await;

        let mut best: Option<(u32, U256)> = None;
        let mut last_error = VenueError::NoRoute;
        for (fee, quote) in tiers.iter().zip(quotes) {
            match quote {
                Ok(out) if best.map_or(true, |(_, b)| out > b) && !out.is_zero() => {
                    best = Some((*fee, out));
                }
                Ok(_) => {}
                Err(VenueError::NoRoute) => {
                    debug!(fee, "Fee tier not available for pair");
                }
                Err(e) => last_error = e,
            }
        }

        match best {
            Some((fee, out)) => {
                self.fee_cache.insert((token_in, token_out), fee);
                Ok(out)
            }
            None => Err(last_error),
        }
    }

    async fn two_hop(
        &self,
        request: &QuoteRequest,
        connector: Address,
        timeout: Duration,
    ) -> Result<U256, VenueError> {
        let mid = self
            .best_single(request.token_in, connector, request.amount_in, timeout)
            .await?;
        self.best_single(connector, request.token_out, mid, timeout).await
    }
}

#[async_trait]
impl SwapVenue for UniswapV3Venue {
    fn venue_id(&self) -> &str {
        &self.id
    }

    async fn quote(&self, request: &QuoteRequest, timeout: Duration) -> Result<QuotePath, VenueError> {
        debug!(
            venue = %self.id,
            token_in = %request.token_in,
            token_out = %request.token_out,
            amount_in = %request.amount_in,
            "Getting Uniswap V3 quote"
        );

        let connectors: Vec<Address> = self
            .connectors
            .iter()
            .copied()
            .filter(|c| *c != request.token_in && *c != request.token_out)
            .collect();

        let direct = self.best_single(request.token_in, request.token_out, request.amount_in, timeout);
        let via = join_all(connectors.iter().map(|c| self.two_hop(request, *c, timeout)));
        let (direct, via) = tokio::join!(direct, via);

        let mut best: Option<(U256, Vec<Address>)> = None;
        let mut last_error = VenueError::NoRoute;

        match direct {
            Ok(out) => best = Some((out, vec![request.token_in, request.token_out])),
            Err(e) => last_error = e,
        }
        for (connector, result) in connectors.iter().zip(via) {
            match result {
                // Strictly greater: at equal output the direct route stays.
                Ok(out) if best.as_ref().map_or(true, |(b, _)| out > *b) => {
                    best = Some((out, vec![request.token_in, *connector, request.token_out]));
                }
                Ok(_) => {}
                Err(VenueError::NoRoute) => {}
                Err(e) => last_error = e,
            }
        }

        let (amount_out, route) = best.ok_or(last_error)?;
        Ok(QuotePath {
            source_venue: self.id.clone(),
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out,
            route,
        })
    }
}
