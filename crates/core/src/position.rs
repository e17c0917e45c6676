//! Evaluated positions and liquidation opportunities.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use scanner_api::QuotePath;
use scanner_chain::{AssetBalance, RawHealthMetric};
use smallvec::SmallVec;
use std::cmp::Ordering;

use crate::u256_math::{self, WAD};

/// Normalized solvency ratio.
///
/// `Finite` holds the ratio in WAD. Below 1.0 (`WAD`) the position is
/// eligible for liquidation. `Infinite` means the account has no debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthRatio {
    Finite(U256),
    Infinite,
}

impl HealthRatio {
    /// Whether the position can be liquidated (ratio < 1.0).
    #[inline]
    pub fn is_eligible(&self) -> bool {
        match self {
            Self::Finite(wad) => *wad < WAD,
            Self::Infinite => false,
        }
    }

    pub fn as_wad(&self) -> Option<U256> {
        match self {
            Self::Finite(wad) => Some(*wad),
            Self::Infinite => None,
        }
    }

    /// Display value. Infinite maps to `f64::INFINITY`.
    pub fn to_f64(&self) -> f64 {
        match self {
            Self::Finite(wad) => u256_math::wad_to_f64(*wad),
            Self::Infinite => f64::INFINITY,
        }
    }
}

impl Ord for HealthRatio {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Finite(a), Self::Finite(b)) => a.cmp(b),
            (Self::Finite(_), Self::Infinite) => Ordering::Less,
            (Self::Infinite, Self::Finite(_)) => Ordering::Greater,
            (Self::Infinite, Self::Infinite) => Ordering::Equal,
        }
    }
}

impl PartialOrd for HealthRatio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for HealthRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finite(_) => write!(f, "{:.4}", self.to_f64()),
            Self::Infinite => write!(f, "inf"),
        }
    }
}

/// A position after health evaluation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Protocol identifier
    pub protocol: String,
    /// Account address
    pub user: Address,
    /// Collateral lines as read from the protocol
    pub collateral: SmallVec<[AssetBalance; 4]>,
    /// Debt lines as read from the protocol
    pub debt: SmallVec<[AssetBalance; 4]>,
    /// Protocol-native health number
    pub raw_health_metric: RawHealthMetric,
    /// Normalized ratio (< 1.0 is eligible)
    pub normalized_health_ratio: HealthRatio,
    /// Total collateral value (WAD, USD or protocol base)
    pub collateral_value_wad: U256,
    /// Collateral value weighted by liquidation thresholds (WAD)
    pub adjusted_collateral_wad: U256,
    /// Total debt value (WAD)
    pub debt_value_wad: U256,
    /// Zero adjusted collateral against nonzero debt
    pub severely_undercollateralized: bool,
    /// Block the state was read at
    pub block_number: u64,
    pub last_evaluated_at: DateTime<Utc>,
}

impl Position {
    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.normalized_health_ratio.is_eligible()
    }

    /// Largest collateral line by value.
    pub fn largest_collateral(&self) -> Option<(&AssetBalance, U256)> {
        largest_line(&self.collateral)
    }

    /// Largest debt line by value.
    pub fn largest_debt(&self) -> Option<(&AssetBalance, U256)> {
        largest_line(&self.debt)
    }
}

fn largest_line(lines: &[AssetBalance]) -> Option<(&AssetBalance, U256)> {
    lines
        .iter()
        .filter(|line| !line.amount.is_zero())
        .map(|line| (line, line_value_wad(line)))
        .max_by(|(a, va), (b, vb)| va.cmp(vb).then_with(|| b.amount.token.cmp(&a.amount.token)))
}

/// Value of one balance line in WAD.
#[inline]
pub fn line_value_wad(line: &AssetBalance) -> U256 {
    u256_math::value_wad(line.amount.raw_amount, line.price, line.amount.decimals, line.price_decimals)
}

/// An eligible position with its value estimates and best swap quote.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub position: Position,
    /// Collateral value (WAD)
    pub estimated_collateral_value: U256,
    /// Debt value (WAD)
    pub estimated_debt_value: U256,
    /// Liquidator bonus on the maximum repayable debt (WAD)
    pub extractable_value: U256,
    /// Best collateral-to-debt swap, if any venue quoted the pair
    pub best_quote: Option<QuotePath>,
    /// Display score; the ranking sort keys define the order
    pub urgency_score: f64,
}

impl Opportunity {
    pub fn protocol(&self) -> &str {
        &self.position.protocol
    }

    pub fn user(&self) -> Address {
        self.position.user
    }
}
