//! Opportunity ranking and deduplication.

use alloy::primitives::{Address, U256};
use scanner_api::QuotePath;
use scanner_chain::LiquidationTerms;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use crate::position::{HealthRatio, Opportunity, Position};
use crate::u256_math::{self, apply_bps};

/// Ordering of the opportunity list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingPolicy {
    /// Lowest ratio first, then highest extractable value
    #[default]
    RatioFirst,
    /// Highest extractable value first, then lowest ratio
    ValueFirst,
}

impl RankingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ratio-first" | "ratio" => Some(Self::RatioFirst),
            "value-first" | "value" => Some(Self::ValueFirst),
            _ => None,
        }
    }
}

/// An eligible position handed to the ranker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligiblePosition {
    pub position: Position,
    pub terms: LiquidationTerms,
    pub best_quote: Option<QuotePath>,
}

/// `min(debt * close_factor, collateral) * bonus`, in WAD.
pub fn extractable_value(position: &Position, terms: &LiquidationTerms) -> U256 {
    let repayable = apply_bps(position.debt_value_wad, terms.close_factor_bps);
    let seizable = u256_math::min(repayable, position.collateral_value_wad);
    apply_bps(seizable, terms.liquidation_bonus_bps)
}

/// Display score: higher is more urgent.
///
/// `(1 - min(ratio, 1)) * 100 + log10(1 + extractable_usd)`
pub fn urgency_score(ratio: &HealthRatio, extractable_wad: U256) -> f64 {
    let ratio = ratio.to_f64().min(1.0);
    let value = u256_math::wad_to_f64(extractable_wad);
    (1.0 - ratio) * 100.0 + (1.0 + value).log10()
}

/// Deduplicate by `(protocol, user)` and sort.
///
/// A duplicate replaces the kept record only when it was evaluated later, or
/// at the same time with a lower ratio. The final tie-break on
/// `(protocol, user)` makes the order total.
pub fn rank(inputs: Vec<EligiblePosition>, policy: RankingPolicy) -> Vec<Opportunity> {
    let mut kept: Vec<EligiblePosition> = Vec::with_capacity(inputs.len());
    let mut index: HashMap<(String, Address), usize> = HashMap::with_capacity(inputs.len());

    for input in inputs {
        let key = (input.position.protocol.clone(), input.position.user);
        match index.get(&key) {
            Some(&i) => {
                if supersedes(&input.position, &kept[i].position) {
                    kept[i] = input;
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(input);
            }
        }
    }

    let mut opportunities: Vec<Opportunity> = kept.into_iter().map(to_opportunity).collect();
    opportunities.sort_by(|a, b| compare(a, b, policy));
    opportunities
}

fn supersedes(candidate: &Position, kept: &Position) -> bool {
    match candidate.last_evaluated_at.cmp(&kept.last_evaluated_at) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.normalized_health_ratio < kept.normalized_health_ratio,
    }
}

fn to_opportunity(input: EligiblePosition) -> Opportunity {
    let extractable = extractable_value(&input.position, &input.terms);
    let urgency = urgency_score(&input.position.normalized_health_ratio, extractable);
    Opportunity {
        estimated_collateral_value: input.position.collateral_value_wad,
        estimated_debt_value: input.position.debt_value_wad,
        extractable_value: extractable,
        best_quote: input.best_quote,
        urgency_score: urgency,
        position: input.position,
    }
}

fn compare(a: &Opportunity, b: &Opportunity, policy: RankingPolicy) -> Ordering {
    let ratio_a = a.position.normalized_health_ratio;
    let ratio_b = b.position.normalized_health_ratio;
    let primary = match policy {
        RankingPolicy::RatioFirst => ratio_a
            .cmp(&ratio_b)
            .then_with(|| Reverse(a.extractable_value).cmp(&Reverse(b.extractable_value))),
        RankingPolicy::ValueFirst => Reverse(a.extractable_value)
            .cmp(&Reverse(b.extractable_value))
            .then_with(|| ratio_a.cmp(&ratio_b)),
    };
    primary
        .then_with(|| a.position.protocol.cmp(&b.position.protocol))
        .then_with(|| a.position.user.cmp(&b.position.user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u256_math::WAD;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use scanner_chain::RawHealthMetric;
    use smallvec::SmallVec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    /// Position with ratio `ratio_pct`% and `debt` USD of debt.
    fn eligible(protocol: &str, user: u8, ratio_pct: u64, debt: u64, evaluated: i64) -> EligiblePosition {
        let debt_wad = U256::from(debt) * WAD;
        EligiblePosition {
            position: Position {
                protocol: protocol.to_string(),
                user: Address::repeat_byte(user),
                collateral: SmallVec::new(),
                debt: SmallVec::new(),
                raw_health_metric: RawHealthMetric::Flag { liquidatable: true },
                normalized_health_ratio: HealthRatio::Finite(WAD * U256::from(ratio_pct) / U256::from(100u8)),
                collateral_value_wad: debt_wad,
                adjusted_collateral_wad: debt_wad * U256::from(ratio_pct) / U256::from(100u8),
                debt_value_wad: debt_wad,
                severely_undercollateralized: ratio_pct == 0,
                block_number: 1,
                last_evaluated_at: at(evaluated),
            },
            terms: LiquidationTerms::default(),
            best_quote: None,
        }
    }

    fn keys(opportunities: &[Opportunity]) -> Vec<(String, u8)> {
        opportunities
            .iter()
            .map(|o| (o.protocol().to_string(), o.user().0[0]))
            .collect()
    }

    #[test]
    fn test_extractable_value() {
        // debt 1000, close factor 50%, bonus 5% => 25
        let input = eligible("a", 1, 90, 1_000, 0);
        assert_eq!(extractable_value(&input.position, &input.terms), U256::from(25u8) * WAD);

        // Seizure capped by collateral value
        let mut capped = input.position.clone();
        capped.collateral_value_wad = U256::from(100u8) * WAD;
        assert_eq!(extractable_value(&capped, &input.terms), U256::from(5u8) * WAD);
    }

    #[test]
    fn test_ratio_first_then_value() {
        let ranked = rank(
            vec![
                eligible("a", 1, 95, 10, 0),
                eligible("a", 2, 80, 10, 0),
                eligible("b", 3, 80, 1_000, 0),
                eligible("c", 4, 0, 1, 0),
            ],
            RankingPolicy::RatioFirst,
        );
        assert_eq!(
            keys(&ranked),
            vec![("c".into(), 4), ("b".into(), 3), ("a".into(), 2), ("a".into(), 1)]
        );
        assert!(ranked[0].position.severely_undercollateralized);
    }

    #[test]
    fn test_value_first() {
        let ranked = rank(
            vec![eligible("a", 1, 10, 10, 0), eligible("a", 2, 90, 1_000, 0)],
            RankingPolicy::ValueFirst,
        );
        assert_eq!(keys(&ranked), vec![("a".into(), 2), ("a".into(), 1)]);
    }

    #[test]
    fn test_full_tie_breaks_on_protocol_and_user() {
        let ranked = rank(
            vec![
                eligible("b", 1, 50, 10, 0),
                eligible("a", 2, 50, 10, 0),
                eligible("a", 1, 50, 10, 0),
            ],
            RankingPolicy::RatioFirst,
        );
        assert_eq!(
            keys(&ranked),
            vec![("a".into(), 1), ("a".into(), 2), ("b".into(), 1)]
        );
    }

    #[test]
    fn test_dedupe_keeps_latest_evaluation() {
        let ranked = rank(
            vec![
                eligible("a", 1, 50, 10, 0),
                eligible("a", 1, 90, 10, 5),
                eligible("b", 1, 50, 10, 0),
            ],
            RankingPolicy::RatioFirst,
        );
        assert_eq!(ranked.len(), 2);
        let a = ranked.iter().find(|o| o.protocol() == "a").unwrap();
        assert_eq!(a.position.last_evaluated_at, at(5));
    }

    #[test]
    fn test_dedupe_same_time_keeps_lower_ratio() {
        let ranked = rank(
            vec![eligible("a", 1, 90, 10, 0), eligible("a", 1, 60, 10, 0)],
            RankingPolicy::RatioFirst,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(
            ranked[0].position.normalized_health_ratio,
            HealthRatio::Finite(WAD * U256::from(60u8) / U256::from(100u8))
        );
    }

    #[test]
    fn test_urgency_score() {
        let deep = urgency_score(&HealthRatio::Finite(U256::ZERO), U256::ZERO);
        assert!((deep - 100.0).abs() < 1e-9);
        let shallow = urgency_score(&HealthRatio::Finite(WAD * U256::from(99u8) / U256::from(100u8)), U256::from(9u8) * WAD);
        assert!((shallow - 2.0).abs() < 1e-6);
        assert!(deep > shallow);
    }
}
