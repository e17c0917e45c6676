//! Health evaluation.
//!
//! Turns a [`RawPosition`] into a [`Position`] with a normalized ratio:
//! threshold-adjusted collateral value over debt value, in WAD. Pure and
//! integer-only; summation is order invariant because every line is rounded
//! on its own before the sum.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use scanner_chain::{AssetBalance, HealthInput, RawPosition};

use crate::position::{line_value_wad, HealthRatio, Position};
use crate::u256_math::{apply_bps, mul_div, normalize_to_wad, WAD};

/// Aggregated values a ratio is derived from (all WAD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Valuation {
    collateral: U256,
    adjusted_collateral: U256,
    debt: U256,
}

/// Evaluate a raw position.
pub fn evaluate(raw: RawPosition, evaluated_at: DateTime<Utc>) -> Position {
    let (valuation, ratio_override) = match &raw.health {
        HealthInput::Itemized => (itemized(&raw.collateral, &raw.debt), None),
        HealthInput::Totals {
            collateral_value,
            debt_value,
            liquidation_threshold_bps,
            value_decimals,
        } => {
            let collateral = normalize_to_wad(*collateral_value, *value_decimals);
            let valuation = Valuation {
                collateral,
                adjusted_collateral: apply_bps(collateral, *liquidation_threshold_bps),
                debt: normalize_to_wad(*debt_value, *value_decimals),
            };
            (valuation, None)
        }
        HealthInput::AdjustedTotals {
            collateral_value,
            adjusted_collateral_value,
            debt_value,
            value_decimals,
        } => {
            let valuation = Valuation {
                collateral: normalize_to_wad(*collateral_value, *value_decimals),
                adjusted_collateral: normalize_to_wad(*adjusted_collateral_value, *value_decimals),
                debt: normalize_to_wad(*debt_value, *value_decimals),
            };
            (valuation, None)
        }
        HealthInput::LiquidityShortfall {
            liquidity,
            shortfall,
            debt_value,
        } => liquidity_shortfall(&raw, *liquidity, *shortfall, *debt_value),
    };

    let (ratio, severe) = match ratio_override {
        Some(ratio) => (ratio, false),
        None => ratio_of(valuation.adjusted_collateral, valuation.debt),
    };

    Position {
        protocol: raw.protocol,
        user: raw.user,
        collateral: raw.collateral,
        debt: raw.debt,
        raw_health_metric: raw.raw_health_metric,
        normalized_health_ratio: ratio,
        collateral_value_wad: valuation.collateral,
        adjusted_collateral_wad: valuation.adjusted_collateral,
        debt_value_wad: valuation.debt,
        severely_undercollateralized: severe,
        block_number: raw.block_number,
        last_evaluated_at: evaluated_at,
    }
}

/// Ratio and severe-undercollateralization flag for adjusted collateral over
/// debt.
pub fn ratio_of(adjusted_collateral: U256, debt: U256) -> (HealthRatio, bool) {
    if debt.is_zero() {
        return (HealthRatio::Infinite, false);
    }
    if adjusted_collateral.is_zero() {
        return (HealthRatio::Finite(U256::ZERO), true);
    }
    let ratio = mul_div(adjusted_collateral, WAD, debt).unwrap_or(U256::MAX);
    (HealthRatio::Finite(ratio), false)
}

fn itemized(collateral: &[AssetBalance], debt: &[AssetBalance]) -> Valuation {
    let mut valuation = Valuation::default();
    for line in collateral {
        let value = line_value_wad(line);
        valuation.collateral = valuation.collateral.saturating_add(value);
        valuation.adjusted_collateral = valuation
            .adjusted_collateral
            .saturating_add(apply_bps(value, line.liquidation_threshold_bps));
    }
    for line in debt {
        valuation.debt = valuation.debt.saturating_add(line_value_wad(line));
    }
    valuation
}

/// Comptroller convention.
///
/// With the borrow value known the ratio is exact:
/// `(debt + liquidity - shortfall) / debt`. Without it, a shortfall means 0
/// and no shortfall is reported as 1.0.
fn liquidity_shortfall(
    raw: &RawPosition,
    liquidity: U256,
    shortfall: U256,
    debt_value: Option<U256>,
) -> (Valuation, Option<HealthRatio>) {
    let lines = itemized(&raw.collateral, &raw.debt);
    match debt_value {
        Some(debt) => {
            let adjusted = debt.saturating_add(liquidity).saturating_sub(shortfall);
            let valuation = Valuation {
                collateral: if lines.collateral.is_zero() {
                    adjusted
                } else {
                    lines.collateral
                },
                adjusted_collateral: adjusted,
                debt,
            };
            (valuation, None)
        }
        None => {
            let ratio = if !shortfall.is_zero() {
                HealthRatio::Finite(U256::ZERO)
            } else if lines.debt.is_zero() && liquidity.is_zero() {
                HealthRatio::Infinite
            } else {
                HealthRatio::Finite(WAD)
            };
            (lines, Some(ratio))
        }
    }
}
