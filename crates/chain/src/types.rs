//! Protocol-agnostic position records produced by adapters.
//!
//! Adapters never compute the normalized health ratio themselves; they
//! describe *how* the ratio should be derived through [`HealthInput`] and the
//! health engine in `scanner-core` does the arithmetic.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Raw token quantity with the decimals it is denominated in.
///
/// Two amounts with different `decimals` must never be combined without going
/// through an explicit normalization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenAmount {
    /// Token contract address
    pub token: Address,
    /// Raw amount (token decimals)
    pub raw_amount: U256,
    /// Token decimals
    pub decimals: u8,
}

impl TokenAmount {
    pub fn new(token: Address, raw_amount: U256, decimals: u8) -> Self {
        Self {
            token,
            raw_amount,
            decimals,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.raw_amount.is_zero()
    }
}

/// One collateral or debt line of a position, priced by the protocol oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Token amount held or owed
    pub amount: TokenAmount,
    /// Oracle price for one whole token
    pub price: U256,
    /// Decimals of `price`
    pub price_decimals: u8,
    /// Liquidation threshold in basis points (0 for debt or disabled collateral)
    pub liquidation_threshold_bps: u16,
}

impl AssetBalance {
    /// Collateral line counted toward solvency with the given threshold.
    pub fn collateral(amount: TokenAmount, price: U256, price_decimals: u8, lt_bps: u16) -> Self {
        Self {
            amount,
            price,
            price_decimals,
            liquidation_threshold_bps: lt_bps,
        }
    }

    /// Debt line.
    pub fn debt(amount: TokenAmount, price: U256, price_decimals: u8) -> Self {
        Self {
            amount,
            price,
            price_decimals,
            liquidation_threshold_bps: 0,
        }
    }
}

/// How the normalized health ratio is derived for a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthInput {
    /// Sum threshold-weighted collateral values over debt values using the
    /// per-asset balances of the position.
    Itemized,
    /// Protocol-reported aggregates in one common value base.
    Totals {
        collateral_value: U256,
        debt_value: U256,
        /// Weighted liquidation threshold (10000 when already folded in)
        liquidation_threshold_bps: u16,
        /// Decimals of both values
        value_decimals: u8,
    },
    /// Aggregates where the protocol applies the threshold per collateral
    /// type, so market and threshold-adjusted values are reported apart.
    AdjustedTotals {
        collateral_value: U256,
        adjusted_collateral_value: U256,
        debt_value: U256,
        /// Decimals of all three values
        value_decimals: u8,
    },
    /// Comptroller convention: account liquidity and shortfall (1e18 USD).
    LiquidityShortfall {
        liquidity: U256,
        shortfall: U256,
        /// Total borrow value (1e18 USD) when it could be read
        debt_value: Option<U256>,
    },
}

/// The protocol's own health number, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawHealthMetric {
    /// Ratio scaled by `10^decimals` (Aave health factor is 1e18)
    ScaledRatio { value: U256, decimals: u8 },
    /// Comptroller liquidity/shortfall pair
    LiquidityShortfall { liquidity: U256, shortfall: U256 },
    /// Vault `ink * spot` against `art * rate` (both RAD)
    Collateralization { collateral: U256, debt: U256 },
    /// Boolean liquidatable flag (Comet `isLiquidatable`)
    Flag { liquidatable: bool },
}

/// Position as read from a protocol, before health evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPosition {
    /// Protocol identifier (e.g. "aave-v3-mainnet")
    pub protocol: String,
    /// Account address
    pub user: Address,
    /// Collateral lines
    pub collateral: SmallVec<[AssetBalance; 4]>,
    /// Debt lines
    pub debt: SmallVec<[AssetBalance; 4]>,
    /// How to derive the normalized ratio
    pub health: HealthInput,
    /// Native health metric
    pub raw_health_metric: RawHealthMetric,
    /// Block the reads were served from (0 if unknown)
    pub block_number: u64,
}

impl RawPosition {
    /// Whether the account holds neither collateral nor debt.
    pub fn is_empty(&self) -> bool {
        let no_lines = self.collateral.iter().all(|c| c.amount.is_zero())
            && self.debt.iter().all(|d| d.amount.is_zero());
        let no_totals = match &self.health {
            HealthInput::Itemized => true,
            HealthInput::Totals {
                collateral_value,
                debt_value,
                ..
            } => collateral_value.is_zero() && debt_value.is_zero(),
            HealthInput::AdjustedTotals {
                collateral_value,
                debt_value,
                ..
            } => collateral_value.is_zero() && debt_value.is_zero(),
            HealthInput::LiquidityShortfall {
                liquidity,
                shortfall,
                debt_value,
            } => {
                liquidity.is_zero()
                    && shortfall.is_zero()
                    && debt_value.map_or(true, |d| d.is_zero())
            }
        };
        no_lines && no_totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_empty_position_detection() {
        let mut position = RawPosition {
            protocol: "test".to_string(),
            user: Address::ZERO,
            collateral: SmallVec::new(),
            debt: SmallVec::new(),
            health: HealthInput::Itemized,
            raw_health_metric: RawHealthMetric::Flag {
                liquidatable: false,
            },
            block_number: 0,
        };
        assert!(position.is_empty());

        position.debt = smallvec![AssetBalance::debt(
            TokenAmount::new(Address::repeat_byte(1), U256::from(5u64), 6),
            U256::from(100_000_000u64),
            8,
        )];
        assert!(!position.is_empty());

        position.debt.clear();
        position.health = HealthInput::LiquidityShortfall {
            liquidity: U256::ZERO,
            shortfall: U256::from(1u64),
            debt_value: None,
        };
        assert!(!position.is_empty());
    }
}
