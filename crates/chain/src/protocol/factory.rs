//! Protocol factory for creating adapters from configuration.
//!
//! A [`ProtocolSpec`] is the TOML-level description of one deployment; the
//! factory validates its addresses and builds the matching adapter.

use super::{LiquidationTerms, ProtocolAdapter, ProtocolKind};
use crate::port::{ChainReader, ReadOptions};
use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

fn default_close_factor_bps() -> u16 {
    5000
}

fn default_liquidation_bonus_bps() -> u16 {
    500
}

fn default_liquidation_ratio_bps() -> u16 {
    15_000
}

/// One collateral type of a vault engine deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSpec {
    /// Ilk name (e.g. "ETH-A")
    pub ilk: String,
    /// Collateral token address
    pub collateral_token: String,
    /// Liquidation ratio (bps)
    #[serde(default = "default_liquidation_ratio_bps")]
    pub liquidation_ratio_bps: u16,
}

/// Deployment description of one lending protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// Unique identifier (e.g. "aave-v3-mainnet")
    pub id: String,
    /// Protocol family ("aave-v3", "compound-v2", "comet", "cdp")
    pub kind: String,
    /// Core contract: pool, comptroller, comet proxy, or vat
    pub address: String,
    /// AAVE balances reader
    #[serde(default)]
    pub balances_reader: Option<String>,
    /// Comptroller oracle override
    #[serde(default)]
    pub oracle: Option<String>,
    /// Comptroller market backed by the native coin
    #[serde(default)]
    pub native_market: Option<String>,
    /// CDP stablecoin
    #[serde(default)]
    pub stablecoin: Option<String>,
    /// CDP collateral types
    #[serde(default)]
    pub vaults: Vec<VaultSpec>,
    /// Close factor (bps)
    #[serde(default = "default_close_factor_bps")]
    pub close_factor_bps: u16,
    /// Liquidation bonus (bps)
    #[serde(default = "default_liquidation_bonus_bps")]
    pub liquidation_bonus_bps: u16,
}

impl ProtocolSpec {
    pub fn terms(&self) -> LiquidationTerms {
        LiquidationTerms {
            close_factor_bps: self.close_factor_bps,
            liquidation_bonus_bps: self.liquidation_bonus_bps,
        }
    }
}

/// Parse address from string, returning error on failure.
pub fn parse_address(s: &str) -> Result<Address> {
    s.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
}

fn parse_optional(s: &Option<String>) -> Result<Option<Address>> {
    s.as_deref().map(parse_address).transpose()
}

/// Builds protocol adapters sharing one chain reader.
#[derive(Debug, Clone)]
pub struct ProtocolFactory {
    reader: Arc<dyn ChainReader>,
    options: ReadOptions,
}

impl ProtocolFactory {
    pub fn new(reader: Arc<dyn ChainReader>) -> Self {
        Self {
            reader,
            options: ReadOptions::default(),
        }
    }

    /// Override log chunking and retry settings.
    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the adapter described by `spec`.
    pub fn build(&self, spec: &ProtocolSpec) -> Result<Arc<dyn ProtocolAdapter>> {
        if spec.id.trim().is_empty() {
            bail!("Protocol id must not be empty");
        }
        let kind = ProtocolKind::parse(&spec.kind)
            .with_context(|| format!("Unknown protocol kind '{}' for '{}'", spec.kind, spec.id))?;
        let address = parse_address(&spec.address)
            .with_context(|| format!("Protocol '{}'", spec.id))?;
        if spec.close_factor_bps == 0 || spec.close_factor_bps > 10_000 {
            bail!(
                "Protocol '{}': close_factor_bps must be in 1..=10000, got {}",
                spec.id,
                spec.close_factor_bps
            );
        }

        let adapter = self.build_kind(kind, address, spec)?;
        info!(protocol = %spec.id, kind = kind.as_str(), address = %address, "Protocol adapter created");
        Ok(adapter)
    }

    fn build_kind(
        &self,
        kind: ProtocolKind,
        address: Address,
        spec: &ProtocolSpec,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        let reader = self.reader.clone();
        match kind {
            #[cfg(feature = "aave-v3")]
            ProtocolKind::AaveV3 => Ok(Arc::new(super::AaveV3Adapter::new(
                super::AaveV3Config {
                    protocol_id: spec.id.clone(),
                    pool_address: address,
                    balances_reader_address: parse_optional(&spec.balances_reader)?,
                    terms: spec.terms(),
                },
                reader,
                self.options,
            ))),
            #[cfg(feature = "compound-v2")]
            ProtocolKind::CompoundV2 => Ok(Arc::new(super::CompoundV2Adapter::new(
                super::CompoundV2Config {
                    protocol_id: spec.id.clone(),
                    comptroller: address,
                    oracle: parse_optional(&spec.oracle)?,
                    native_market: parse_optional(&spec.native_market)?,
                    terms: spec.terms(),
                },
                reader,
                self.options,
            ))),
            #[cfg(feature = "compound-v3")]
            ProtocolKind::Comet => Ok(Arc::new(super::CometAdapter::new(
                super::CometConfig {
                    protocol_id: spec.id.clone(),
                    comet: address,
                    terms: spec.terms(),
                },
                reader,
                self.options,
            ))),
            #[cfg(feature = "cdp")]
            ProtocolKind::Cdp => {
                let stablecoin = parse_optional(&spec.stablecoin)?
                    .with_context(|| format!("Protocol '{}': cdp requires `stablecoin`", spec.id))?;
                if spec.vaults.is_empty() {
                    bail!("Protocol '{}': cdp requires at least one vault", spec.id);
                }
                let vaults = spec
                    .vaults
                    .iter()
                    .map(|v| {
                        Ok(super::CdpVault {
                            ilk: v.ilk.clone(),
                            collateral_token: parse_address(&v.collateral_token)?,
                            liquidation_ratio_bps: v.liquidation_ratio_bps,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(super::CdpAdapter::new(
                    super::CdpConfig {
                        protocol_id: spec.id.clone(),
                        vat: address,
                        stablecoin,
                        vaults,
                        terms: spec.terms(),
                    },
                    reader,
                    self.options,
                )))
            }
            #[allow(unreachable_patterns)]
            other => bail!(
                "Protocol '{}': support for '{}' is not compiled in",
                spec.id,
                other.as_str()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::FakeReader;

    fn spec(kind: &str) -> ProtocolSpec {
        ProtocolSpec {
            id: format!("{}-test", kind),
            kind: kind.to_string(),
            address: "0x0000000000000000000000000000000000000001".to_string(),
            balances_reader: None,
            oracle: None,
            native_market: None,
            stablecoin: None,
            vaults: Vec::new(),
            close_factor_bps: 5000,
            liquidation_bonus_bps: 500,
        }
    }

    #[test]
    fn test_build_each_kind() {
        let factory = ProtocolFactory::new(Arc::new(FakeReader::new()));

        let aave = factory.build(&spec("aave-v3")).unwrap();
        assert_eq!(aave.kind(), ProtocolKind::AaveV3);
        assert_eq!(aave.protocol_id(), "aave-v3-test");

        assert_eq!(factory.build(&spec("compound-v2")).unwrap().kind(), ProtocolKind::CompoundV2);
        assert_eq!(factory.build(&spec("comet")).unwrap().kind(), ProtocolKind::Comet);

        let mut cdp = spec("cdp");
        assert!(factory.build(&cdp).is_err());
        cdp.stablecoin = Some("0x00000000000000000000000000000000000000da".to_string());
        cdp.vaults.push(VaultSpec {
            ilk: "ETH-A".to_string(),
            collateral_token: "0x0000000000000000000000000000000000000002".to_string(),
            liquidation_ratio_bps: 15_000,
        });
        assert_eq!(factory.build(&cdp).unwrap().kind(), ProtocolKind::Cdp);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        let factory = ProtocolFactory::new(Arc::new(FakeReader::new()));

        assert!(factory.build(&spec("aave-v9")).is_err());

        let mut bad = spec("aave-v3");
        bad.address = "invalid".to_string();
        assert!(factory.build(&bad).is_err());

        let mut bad = spec("aave-v3");
        bad.close_factor_bps = 0;
        assert!(factory.build(&bad).is_err());
    }

    #[test]
    fn test_spec_from_toml_defaults() {
        let spec: ProtocolSpec = toml::from_str(
            r#"
            id = "comet-usdc"
            kind = "comet"
            address = "0xc3d688B66703497DAA19211EEdff47f25384cdc3"
            "#,
        )
        .unwrap();
        assert_eq!(spec.close_factor_bps, 5000);
        assert_eq!(spec.liquidation_bonus_bps, 500);
        assert!(spec.vaults.is_empty());
    }

    #[test]
    fn test_parse_address() {
        let addr = parse_address("0x0000000000000000000000000000000000000000").unwrap();
        assert_eq!(addr, Address::ZERO);
        assert!(parse_address("invalid").is_err());
    }
}
