//! Swap venue abstractions for opportunity quoting.
//!
//! This module provides a trait-based abstraction over quote sources so that
//! on-chain AMMs and off-chain aggregators can be queried side by side.
//!
//! # Supported Venues
//!
//! - `uniswap-v3`: QuoterV2, single hop over fee tiers and two hops through connectors
//! - `uniswap-v2`: Router `getAmountsOut` on direct and connector paths
//! - `http`: REST route API (`GET {base}/v2/route`)
//!
//! # Example
//!
//! ```rust,ignore
//! use scanner_api::swap::{QuoteAggregator, QuoteRequest, VenueFactory};
//!
//! let factory = VenueFactory::new(reader);
//! let aggregator = QuoteAggregator::new(specs.iter().map(|s| factory.build(s)).collect::<Result<_>>()?);
//!
//! let outcome = aggregator.best_quote(&request, timeout).await;
//! if let Some(best) = outcome.best {
//!     println!("{} via {}", best.amount_out, best.source_venue);
//! }
//! ```

mod aggregator;
mod factory;
mod http;
mod uniswap_v2;
mod uniswap_v3;

pub use aggregator::{QuoteAggregator, QuoteOutcome};
pub use factory::{VenueFactory, VenueKind, VenueSpec};
pub use http::HttpRouteVenue;
pub use uniswap_v2::UniswapV2Venue;
pub use uniswap_v3::{FeeTier, UniswapV3Venue};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use scanner_chain::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Exact-input quote request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    /// Input token address
    pub token_in: Address,
    /// Output token address
    pub token_out: Address,
    /// Input amount (raw, with decimals)
    pub amount_in: U256,
    /// Decimals of input token
    pub decimals_in: u8,
}

impl QuoteRequest {
    pub fn new(token_in: Address, token_out: Address, amount_in: U256, decimals_in: u8) -> Self {
        Self {
            token_in,
            token_out,
            amount_in,
            decimals_in,
        }
    }

    /// Whether any venue should be asked at all.
    pub fn is_quotable(&self) -> bool {
        self.token_in != self.token_out && !self.amount_in.is_zero()
    }
}

/// A priced route from one venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotePath {
    /// Venue that produced the quote
    pub source_venue: String,
    /// Input token
    pub token_in: Address,
    /// Output token
    pub token_out: Address,
    /// Input amount
    pub amount_in: U256,
    /// Expected output amount
    pub amount_out: U256,
    /// Tokens along the route, endpoints included
    pub route: Vec<Address>,
}

impl QuotePath {
    /// Number of swaps along the route.
    pub fn hops(&self) -> usize {
        self.route.len().saturating_sub(1)
    }
}

/// Why a venue produced no quote.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VenueError {
    /// The venue itself is down or misconfigured.
    #[error("venue unavailable: {0}")]
    Unavailable(String),
    /// The venue has no liquidity for the pair.
    #[error("no route")]
    NoRoute,
    /// The venue did not answer in time.
    #[error("venue timed out after {0:?}")]
    Timeout(Duration),
    /// Network failure talking to the venue.
    #[error("transport error: {0}")]
    Transport(String),
}

impl VenueError {
    /// Whether the failure is about the venue rather than the pair.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, Self::NoRoute)
    }
}

impl From<ChainError> for VenueError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Timeout(d) => Self::Timeout(d),
            ChainError::Transport(msg) => Self::Transport(msg),
            // Quoters revert when no pool exists for the pair.
            ChainError::Revert(_) => Self::NoRoute,
            ChainError::Decode(msg) => Self::Unavailable(msg),
        }
    }
}

/// A source of exact-input swap quotes.
///
/// Implement this trait to add support for a new DEX or routing API.
#[async_trait]
pub trait SwapVenue: Send + Sync + Debug {
    /// Venue identifier (e.g., "uniswap-v3-mainnet").
    fn venue_id(&self) -> &str;

    /// Quote `request` within `timeout`.
    async fn quote(&self, request: &QuoteRequest, timeout: Duration) -> Result<QuotePath, VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_request_quotable() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        assert!(QuoteRequest::new(a, b, U256::from(1000), 18).is_quotable());
        assert!(!QuoteRequest::new(a, a, U256::from(1000), 18).is_quotable());
        assert!(!QuoteRequest::new(a, b, U256::ZERO, 18).is_quotable());
    }

    #[test]
    fn test_quote_path_hops() {
        let path = QuotePath {
            source_venue: "test".to_string(),
            token_in: Address::ZERO,
            token_out: Address::repeat_byte(1),
            amount_in: U256::from(1000),
            amount_out: U256::from(990),
            route: vec![Address::ZERO, Address::repeat_byte(1)],
        };
        assert_eq!(path.hops(), 1);
    }

    #[test]
    fn test_chain_error_mapping() {
        assert_eq!(VenueError::from(ChainError::Revert("x".into())), VenueError::NoRoute);
        assert!(VenueError::from(ChainError::Transport("x".into())).is_unavailable());
        assert!(!VenueError::NoRoute.is_unavailable());
    }
}
