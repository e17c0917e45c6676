//! Venue factory for creating quote sources from configuration.

use super::{HttpRouteVenue, SwapVenue, UniswapV2Venue, UniswapV3Venue};
use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use scanner_chain::protocol::parse_address;
use scanner_chain::ChainReader;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn default_cache_ttl_ms() -> u64 {
    5000
}

/// Venue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VenueKind {
    UniswapV3,
    UniswapV2,
    Http,
}

impl VenueKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "uniswap-v3" | "uniswapv3" | "univ3" => Some(Self::UniswapV3),
            "uniswap-v2" | "uniswapv2" | "univ2" => Some(Self::UniswapV2),
            "http" => Some(Self::Http),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniswapV3 => "uniswap-v3",
            Self::UniswapV2 => "uniswap-v2",
            Self::Http => "http",
        }
    }
}

/// Deployment description of one venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueSpec {
    /// Unique identifier (e.g. "uniswap-v3-mainnet")
    pub id: String,
    /// Venue family ("uniswap-v3", "uniswap-v2", "http")
    pub kind: String,
    /// Quoter or router contract
    #[serde(default)]
    pub address: Option<String>,
    /// Route API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Intermediate tokens for two-hop routes
    #[serde(default)]
    pub connectors: Vec<String>,
    /// Stablecoins, used to order fee tiers
    #[serde(default)]
    pub stablecoins: Vec<String>,
    /// Route cache TTL for HTTP venues
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn parse_list(values: &[String]) -> Result<Vec<Address>> {
    values.iter().map(|s| parse_address(s)).collect()
}

/// Builds swap venues sharing one chain reader.
#[derive(Debug, Clone)]
pub struct VenueFactory {
    reader: Arc<dyn ChainReader>,
}

impl VenueFactory {
    pub fn new(reader: Arc<dyn ChainReader>) -> Self {
        Self { reader }
    }

    /// Build the venue described by `spec`.
    pub fn build(&self, spec: &VenueSpec) -> Result<Arc<dyn SwapVenue>> {
        if spec.id.trim().is_empty() {
            bail!("Venue id must not be empty");
        }
        let kind = VenueKind::parse(&spec.kind)
            .with_context(|| format!("Unknown venue kind '{}' for '{}'", spec.kind, spec.id))?;
        let connectors = parse_list(&spec.connectors).with_context(|| format!("Venue '{}'", spec.id))?;

        let venue: Arc<dyn SwapVenue> = match kind {
            VenueKind::UniswapV3 => {
                let quoter = self.contract_address(spec)?;
                let stablecoins =
                    parse_list(&spec.stablecoins).with_context(|| format!("Venue '{}'", spec.id))?;
                Arc::new(
                    UniswapV3Venue::new(&spec.id, quoter, self.reader.clone())
                        .with_connectors(connectors)
                        .with_stablecoins(stablecoins),
                )
            }
            VenueKind::UniswapV2 => {
                let router = self.contract_address(spec)?;
                Arc::new(UniswapV2Venue::new(&spec.id, router, self.reader.clone()).with_connectors(connectors))
            }
            VenueKind::Http => {
                let base_url = spec
                    .base_url
                    .as_deref()
                    .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
                    .with_context(|| format!("Venue '{}' requires an http(s) base_url", spec.id))?;
                Arc::new(
                    HttpRouteVenue::new(&spec.id, base_url)
                        .with_cache_ttl(Duration::from_millis(spec.cache_ttl_ms)),
                )
            }
        };

        info!(venue = %spec.id, kind = kind.as_str(), "Swap venue created");
        Ok(venue)
    }

    fn contract_address(&self, spec: &VenueSpec) -> Result<Address> {
        let raw = spec
            .address
            .as_deref()
            .with_context(|| format!("Venue '{}' requires an address", spec.id))?;
        parse_address(raw).with_context(|| format!("Venue '{}'", spec.id))
    }
}
