//! Scan reports and their delivery.
//!
//! Amounts are serialized as decimal strings; USD figures are added as floats
//! for display only.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanner_api::QuotePath;
use scanner_chain::{AssetBalance, RawHealthMetric};
use serde::ser::Serializer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::info;

use crate::discovery::DiscoverySource;
use crate::error::ScanId;
use crate::position::{line_value_wad, Opportunity};
use crate::u256_math::wad_to_f64;

/// Per-protocol outcome of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolCoverage {
    /// Distinct candidates found before truncation
    pub candidates_seen: usize,
    /// Candidates whose position was loaded and evaluated
    pub candidates_evaluated: usize,
    /// Candidates that failed individually
    pub skipped: usize,
    /// Candidates lost to systemic read failures
    pub read_failures: usize,
    /// Candidates found eligible
    pub eligible: usize,
    /// The protocol could not be read this cycle
    pub source_unavailable: bool,
    /// The per-protocol deadline cut evaluation short
    pub deadline_exceeded: bool,
    /// Candidate source
    pub discovery: Option<DiscoverySource>,
}

/// Result of one scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub scan_id: ScanId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Ranked, deduplicated opportunities
    pub opportunities: Vec<Opportunity>,
    pub per_protocol_coverage: BTreeMap<String, ProtocolCoverage>,
    /// Venues that were down or misbehaving during the cycle
    pub unavailable_venues: Vec<String>,
}

impl ScanReport {
    /// Whether every protocol was fully scanned.
    pub fn is_complete(&self) -> bool {
        self.per_protocol_coverage
            .values()
            .all(|c| !c.source_unavailable && !c.deadline_exceeded)
    }

    /// Same report content, ignoring ids and timestamps.
    pub fn same_content(&self, other: &ScanReport) -> bool {
        self.per_protocol_coverage == other.per_protocol_coverage
            && self.unavailable_venues == other.unavailable_venues
            && self.opportunities.len() == other.opportunities.len()
            && self
                .opportunities
                .iter()
                .zip(&other.opportunities)
                .all(|(a, b)| {
                    a.protocol() == b.protocol()
                        && a.user() == b.user()
                        && a.position.normalized_health_ratio == b.position.normalized_health_ratio
                        && a.extractable_value == b.extractable_value
                        && a.best_quote == b.best_quote
                })
    }
}

#[derive(Serialize)]
struct BalanceRecord {
    token: Address,
    amount: String,
    decimals: u8,
    price: String,
    price_decimals: u8,
    liquidation_threshold_bps: u16,
    value_usd: f64,
}

impl From<&AssetBalance> for BalanceRecord {
    fn from(line: &AssetBalance) -> Self {
        Self {
            token: line.amount.token,
            amount: line.amount.raw_amount.to_string(),
            decimals: line.amount.decimals,
            price: line.price.to_string(),
            price_decimals: line.price_decimals,
            liquidation_threshold_bps: line.liquidation_threshold_bps,
            value_usd: wad_to_f64(line_value_wad(line)),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum MetricRecord {
    ScaledRatio { value: String, decimals: u8 },
    LiquidityShortfall { liquidity: String, shortfall: String },
    Collateralization { collateral: String, debt: String },
    Flag { liquidatable: bool },
}

impl From<&RawHealthMetric> for MetricRecord {
    fn from(metric: &RawHealthMetric) -> Self {
        match metric {
            RawHealthMetric::ScaledRatio { value, decimals } => Self::ScaledRatio {
                value: value.to_string(),
                decimals: *decimals,
            },
            RawHealthMetric::LiquidityShortfall { liquidity, shortfall } => Self::LiquidityShortfall {
                liquidity: liquidity.to_string(),
                shortfall: shortfall.to_string(),
            },
            RawHealthMetric::Collateralization { collateral, debt } => Self::Collateralization {
                collateral: collateral.to_string(),
                debt: debt.to_string(),
            },
            RawHealthMetric::Flag { liquidatable } => Self::Flag {
                liquidatable: *liquidatable,
            },
        }
    }
}

#[derive(Serialize)]
struct QuoteRecord<'a> {
    source_venue: &'a str,
    token_in: Address,
    token_out: Address,
    amount_in: String,
    amount_out: String,
    route: &'a [Address],
}

impl<'a> From<&'a QuotePath> for QuoteRecord<'a> {
    fn from(quote: &'a QuotePath) -> Self {
        Self {
            source_venue: &quote.source_venue,
            token_in: quote.token_in,
            token_out: quote.token_out,
            amount_in: quote.amount_in.to_string(),
            amount_out: quote.amount_out.to_string(),
            route: &quote.route,
        }
    }
}

#[derive(Serialize)]
struct OpportunityRecord<'a> {
    protocol: &'a str,
    user: Address,
    /// `None` for an infinite ratio
    health_ratio: Option<f64>,
    health_ratio_wad: Option<String>,
    severely_undercollateralized: bool,
    raw_health_metric: MetricRecord,
    collateral_value_wad: String,
    debt_value_wad: String,
    extractable_value_wad: String,
    collateral_value_usd: f64,
    debt_value_usd: f64,
    extractable_value_usd: f64,
    urgency_score: f64,
    collateral: Vec<BalanceRecord>,
    debt: Vec<BalanceRecord>,
    best_quote: Option<QuoteRecord<'a>>,
    block_number: u64,
    evaluated_at: DateTime<Utc>,
}

fn decimal(value: U256) -> String {
    value.to_string()
}

impl Serialize for Opportunity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let position = &self.position;
        let ratio = position.normalized_health_ratio;
        OpportunityRecord {
            protocol: &position.protocol,
            user: position.user,
            health_ratio: ratio.as_wad().map(wad_to_f64),
            health_ratio_wad: ratio.as_wad().map(decimal),
            severely_undercollateralized: position.severely_undercollateralized,
            raw_health_metric: MetricRecord::from(&position.raw_health_metric),
            collateral_value_wad: decimal(self.estimated_collateral_value),
            debt_value_wad: decimal(self.estimated_debt_value),
            extractable_value_wad: decimal(self.extractable_value),
            collateral_value_usd: wad_to_f64(self.estimated_collateral_value),
            debt_value_usd: wad_to_f64(self.estimated_debt_value),
            extractable_value_usd: wad_to_f64(self.extractable_value),
            urgency_score: self.urgency_score,
            collateral: position.collateral.iter().map(BalanceRecord::from).collect(),
            debt: position.debt.iter().map(BalanceRecord::from).collect(),
            best_quote: self.best_quote.as_ref().map(QuoteRecord::from),
            block_number: position.block_number,
            evaluated_at: position.last_evaluated_at,
        }
        .serialize(serializer)
    }
}

/// Destination of completed reports.
#[async_trait]
pub trait ReportSink: Send + Sync + Debug {
    async fn deliver(&self, report: &ScanReport) -> anyhow::Result<()>;
}

/// Logs a summary and the top opportunities.
#[derive(Debug, Clone, Copy)]
pub struct LogReportSink {
    /// Opportunities to log individually
    pub top: usize,
}

impl Default for LogReportSink {
    fn default() -> Self {
        Self { top: 10 }
    }
}

#[async_trait]
impl ReportSink for LogReportSink {
    async fn deliver(&self, report: &ScanReport) -> anyhow::Result<()> {
        info!(
            scan_id = %report.scan_id,
            opportunities = report.opportunities.len(),
            protocols = report.per_protocol_coverage.len(),
            unavailable_venues = report.unavailable_venues.len(),
            duration_ms = (report.completed_at - report.started_at).num_milliseconds(),
            "Scan report"
        );
        for (rank, opp) in report.opportunities.iter().take(self.top).enumerate() {
            info!(
                rank = rank + 1,
                protocol = %opp.protocol(),
                user = %opp.user(),
                ratio = %opp.position.normalized_health_ratio,
                debt_usd = wad_to_f64(opp.estimated_debt_value),
                extractable_usd = wad_to_f64(opp.extractable_value),
                venue = opp.best_quote.as_ref().map(|q| q.source_venue.as_str()).unwrap_or("-"),
                "Opportunity"
            );
        }
        Ok(())
    }
}

/// Writes each report as one JSON line to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStdoutSink;

#[async_trait]
impl ReportSink for JsonStdoutSink {
    async fn deliver(&self, report: &ScanReport) -> anyhow::Result<()> {
        let line = serde_json::to_string(report)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        Ok(())
    }
}

/// Forwards reports over a channel.
#[derive(Debug, Clone)]
pub struct ChannelReportSink {
    tx: mpsc::Sender<ScanReport>,
}

impl ChannelReportSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScanReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReportSink for ChannelReportSink {
    async fn deliver(&self, report: &ScanReport) -> anyhow::Result<()> {
        self.tx
            .send(report.clone())
            .await
            .map_err(|_| anyhow::anyhow!("report receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{HealthRatio, Position};
    use crate::u256_math::WAD;
    use scanner_chain::TokenAmount;
    use smallvec::smallvec;
    use uuid::Uuid;

    fn report() -> ScanReport {
        let position = Position {
            protocol: "aave-v3".to_string(),
            user: Address::repeat_byte(0x11),
            collateral: smallvec![AssetBalance::collateral(
                TokenAmount::new(Address::repeat_byte(1), U256::from(2_000_000u64), 6),
                U256::from(100_000_000u64),
                8,
                8000
            )],
            debt: smallvec![],
            raw_health_metric: RawHealthMetric::ScaledRatio {
                value: WAD / U256::from(2u8),
                decimals: 18,
            },
            normalized_health_ratio: HealthRatio::Finite(WAD / U256::from(2u8)),
            collateral_value_wad: U256::from(2u8) * WAD,
            adjusted_collateral_wad: WAD,
            debt_value_wad: U256::from(2u8) * WAD,
            severely_undercollateralized: false,
            block_number: 42,
            last_evaluated_at: Utc::now(),
        };
        let now = Utc::now();
        ScanReport {
            scan_id: Uuid::new_v4(),
            started_at: now,
            completed_at: now,
            opportunities: vec![Opportunity {
                estimated_collateral_value: position.collateral_value_wad,
                estimated_debt_value: position.debt_value_wad,
                extractable_value: WAD / U256::from(20u8),
                best_quote: None,
                urgency_score: 50.02,
                position,
            }],
            per_protocol_coverage: BTreeMap::from([(
                "aave-v3".to_string(),
                ProtocolCoverage {
                    candidates_seen: 3,
                    candidates_evaluated: 2,
                    skipped: 1,
                    eligible: 1,
                    discovery: Some(DiscoverySource::Events),
                    ..Default::default()
                },
            )]),
            unavailable_venues: Vec::new(),
        }
    }

    #[test]
    fn test_report_json_uses_decimal_strings() {
        let json = serde_json::to_value(report()).unwrap();
        let opp = &json["opportunities"][0];
        assert_eq!(opp["health_ratio_wad"], "500000000000000000");
        assert_eq!(opp["health_ratio"], 0.5);
        assert_eq!(opp["extractable_value_wad"], "50000000000000000");
        assert_eq!(opp["raw_health_metric"]["kind"], "scaled_ratio");
        assert_eq!(opp["collateral"][0]["amount"], "2000000");
        assert_eq!(opp["collateral"][0]["value_usd"], 2.0);
        assert_eq!(json["per_protocol_coverage"]["aave-v3"]["skipped"], 1);
        assert_eq!(json["per_protocol_coverage"]["aave-v3"]["discovery"], "events");
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelReportSink::new(1);
        let report = report();
        sink.deliver(&report).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().scan_id, report.scan_id);
    }

    #[test]
    fn test_same_content_ignores_ids() {
        let a = report();
        let mut b = a.clone();
        b.scan_id = Uuid::new_v4();
        assert!(a.same_content(&b));
        b.opportunities.clear();
        assert!(!a.same_content(&b));
        assert!(a.is_complete());
    }
}
