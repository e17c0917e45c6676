//! Swap quoting for the position scanner.
//!
//! This crate provides quote sources for:
//! - Uniswap V3 QuoterV2 and Uniswap V2-style routers (on-chain, via the chain reader)
//! - REST route APIs (off-chain, via reqwest)
//!
//! and a [`swap::QuoteAggregator`] that picks the best route across them.

pub mod swap;

pub use swap::{
    QuoteAggregator, QuoteOutcome, QuotePath, QuoteRequest, SwapVenue, VenueError, VenueFactory, VenueKind,
    VenueSpec,
};
