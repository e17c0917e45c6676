//! Scan cycle orchestration.
//!
//! Each protocol gets one producer task: probe, discover, then a bounded pool
//! of workers that load, evaluate and (when eligible) quote candidates.
//! Worker results go over an mpsc channel to a collector owned by the cycle.
//! A producer is dropped at its protocol deadline; collectors stop waiting
//! `grace` later and keep whatever arrived.

use alloy::primitives::Address;
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use scanner_api::{QuoteAggregator, QuoteOutcome, QuotePath, QuoteRequest, VenueError};
use scanner_chain::{ChainError, LiquidationTerms, LoadError, ProtocolAdapter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::config::ScanConfig;
use crate::discovery::{discover, BlockWindow, DiscoverySource, DiscoveryStrategy};
use crate::error::{ScanError, ScanId};
use crate::events::{EventCategory, EventLevel, EventSink, ScanEvent};
use crate::health;
use crate::phase::{CyclePhase, PhaseTracker, ProtocolPhase};
use crate::position::Position;
use crate::ranker::{rank, EligiblePosition};
use crate::report::{ProtocolCoverage, ScanReport};
use crate::u256_math::{self, apply_bps, apply_bps_up, mul_div};

const CHANNEL_CAPACITY: usize = 256;

/// A protocol adapter plus how its candidates are found.
#[derive(Debug, Clone)]
pub struct ProtocolRegistration {
    pub adapter: Arc<dyn ProtocolAdapter>,
    pub strategy: DiscoveryStrategy,
    pub watch_list: Vec<Address>,
}

impl ProtocolRegistration {
    pub fn new(adapter: Arc<dyn ProtocolAdapter>) -> Self {
        Self {
            adapter,
            strategy: DiscoveryStrategy::default(),
            watch_list: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: DiscoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_watch_list(mut self, watch_list: Vec<Address>) -> Self {
        self.watch_list = watch_list;
        self
    }

    pub fn protocol_id(&self) -> &str {
        self.adapter.protocol_id()
    }
}

/// Drives scan cycles over the registered protocols and venues.
#[derive(Debug)]
pub struct ScanOrchestrator {
    protocols: BTreeMap<String, ProtocolRegistration>,
    quotes: QuoteAggregator,
    events: Arc<dyn EventSink>,
    phases: Arc<PhaseTracker>,
}

impl ScanOrchestrator {
    pub fn new(quotes: QuoteAggregator, events: Arc<dyn EventSink>) -> Self {
        Self {
            protocols: BTreeMap::new(),
            quotes,
            events,
            phases: Arc::new(PhaseTracker::new()),
        }
    }

    /// Register a protocol. Ids must be unique.
    pub fn register(&mut self, registration: ProtocolRegistration) -> Result<(), ScanError> {
        let id = registration.protocol_id().to_string();
        if self.protocols.contains_key(&id) {
            return Err(ScanError::config(format!("protocol '{}' registered twice", id)));
        }
        self.protocols.insert(id, registration);
        Ok(())
    }

    pub fn protocol_ids(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }

    pub fn venue_ids(&self) -> Vec<String> {
        self.quotes.venue_ids()
    }

    pub fn phases(&self) -> Arc<PhaseTracker> {
        self.phases.clone()
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    /// Check `config` on its own and against the registered components.
    pub fn validate(&self, config: &ScanConfig) -> Result<(), ScanError> {
        config.validate()?;
        if let Some(unknown) = config.protocols.iter().find(|p| !self.protocols.contains_key(*p)) {
            return Err(ScanError::config(format!("unknown protocol '{}'", unknown)));
        }
        let venues: BTreeSet<String> = self.quotes.venue_ids().into_iter().collect();
        if let Some(unknown) = config.venues.iter().find(|v| !venues.contains(*v)) {
            return Err(ScanError::config(format!("unknown venue '{}'", unknown)));
        }
        Ok(())
    }

    /// Run one scan cycle.
    ///
    /// Per-protocol and per-venue failures end up in the report coverage; the
    /// only errors are invalid configuration and cancellation.
    #[instrument(skip_all, fields(scan_id = %scan_id))]
    pub async fn run_cycle(
        &self,
        scan_id: ScanId,
        config: &ScanConfig,
        cancel: CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        self.validate(config)?;

        let started_at = Utc::now();
        let deadline = Instant::now() + config.per_protocol_deadline();
        let hard_deadline = deadline + config.grace();
        let quotes = Arc::new(self.quotes.subset(|id| config.venues.contains(id)));

        self.phases.begin(&config.protocols);
        info!(
            protocols = config.protocols.len(),
            venues = config.venues.len(),
            from_block = config.block_window.from,
            to_block = config.block_window.to,
            max_users = config.max_users_per_protocol,
            "Scan cycle started"
        );

        let mut producers = JoinSet::new();
        let mut collectors = Vec::with_capacity(config.protocols.len());
        for (protocol, registration) in config
            .protocols
            .iter()
            .filter_map(|p| self.protocols.get(p).map(|r| (p, r)))
        {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let task = ProtocolTask {
                protocol: protocol.clone(),
                registration: registration.clone(),
                quotes: quotes.clone(),
                phases: self.phases.clone(),
                window: config.block_window,
                max_users: config.max_users_per_protocol,
                call_timeout: config.per_call_timeout(),
                concurrency: config.concurrency,
                deadline,
            };
            producers.spawn(run_protocol(Arc::new(task), tx).instrument(info_span!("protocol", protocol = %protocol)));
            collectors.push(self.collect(protocol.clone(), registration.adapter.liquidation_terms(), rx, hard_deadline));
        }

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                producers.abort_all();
                self.phases.advance(CyclePhase::Canceled);
                warn!("Scan cycle canceled");
                self.events.emit(ScanEvent::new(
                    EventLevel::Warn,
                    EventCategory::CycleSummary,
                    format!("Scan {} canceled", scan_id),
                ));
                return Err(ScanError::CycleCanceled);
            }
            results = join_all(collectors) => results,
        };

        // Whatever is still running is past the hard bound.
        producers.abort_all();
        while let Some(joined) = producers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Protocol task panicked");
                }
            }
        }

        self.phases.advance(CyclePhase::Ranking);
        let mut per_protocol_coverage = BTreeMap::new();
        let mut eligible = Vec::new();
        let mut venue_failures: BTreeMap<String, VenueError> = BTreeMap::new();
        for (protocol, result) in results {
            for (venue, failure) in result.venue_failures {
                if failure.is_unavailable() {
                    venue_failures.entry(venue).or_insert(failure);
                }
            }
            eligible.extend(result.eligible);
            per_protocol_coverage.insert(protocol, result.coverage);
        }

        for (venue, failure) in &venue_failures {
            warn!(venue = %venue, error = %failure, "Venue unavailable");
            self.events.emit(ScanEvent::new(
                EventLevel::Error,
                EventCategory::Error,
                format!("Venue {} unavailable: {}", venue, failure),
            ));
        }

        let opportunities = rank(eligible, config.ranking_policy);
        let report = ScanReport {
            scan_id,
            started_at,
            completed_at: Utc::now(),
            opportunities,
            per_protocol_coverage,
            unavailable_venues: venue_failures.into_keys().collect(),
        };
        self.phases.advance(CyclePhase::Completed);

        let evaluated: usize = report.per_protocol_coverage.values().map(|c| c.candidates_evaluated).sum();
        let skipped: usize = report.per_protocol_coverage.values().map(|c| c.skipped).sum();
        info!(
            opportunities = report.opportunities.len(),
            evaluated,
            skipped,
            unavailable_venues = report.unavailable_venues.len(),
            complete = report.is_complete(),
            elapsed_ms = (report.completed_at - started_at).num_milliseconds(),
            "Scan cycle completed"
        );
        self.events.emit(ScanEvent::info(
            EventCategory::CycleSummary,
            format!(
                "Scan {} completed: {} opportunities, {} evaluated, {} skipped",
                scan_id,
                report.opportunities.len(),
                evaluated,
                skipped
            ),
        ));

        Ok(report)
    }

    /// Receive one protocol's results until its producer finishes or the hard
    /// deadline passes.
    async fn collect(
        &self,
        protocol: String,
        terms: LiquidationTerms,
        mut rx: mpsc::Receiver<Message>,
        hard_deadline: Instant,
    ) -> (String, ProtocolResult) {
        let mut result = ProtocolResult::default();
        loop {
            match timeout_at(hard_deadline, rx.recv()).await {
                Ok(Some(message)) => self.apply(&protocol, &terms, &mut result, message),
                Ok(None) => break,
                Err(_) => {
                    warn!(protocol = %protocol, "Protocol task exceeded its grace period");
                    result.coverage.deadline_exceeded = true;
                    while let Ok(message) = rx.try_recv() {
                        self.apply(&protocol, &terms, &mut result, message);
                    }
                    break;
                }
            }
        }

        let coverage = &mut result.coverage;
        if !result.finished && !coverage.deadline_exceeded && !coverage.source_unavailable {
            coverage.source_unavailable = true;
            self.emit_unavailable(&protocol, "protocol task ended unexpectedly");
        }

        let phase = if coverage.source_unavailable {
            ProtocolPhase::Unavailable
        } else if coverage.deadline_exceeded {
            ProtocolPhase::DeadlineExceeded
        } else {
            ProtocolPhase::Completed
        };
        self.phases.set_protocol(&protocol, phase);

        info!(
            protocol = %protocol,
            seen = coverage.candidates_seen,
            evaluated = coverage.candidates_evaluated,
            skipped = coverage.skipped,
            read_failures = coverage.read_failures,
            eligible = coverage.eligible,
            unavailable = coverage.source_unavailable,
            deadline_exceeded = coverage.deadline_exceeded,
            "Protocol scan finished"
        );
        if !coverage.source_unavailable || coverage.candidates_evaluated > 0 {
            self.events.emit(
                ScanEvent::info(
                    EventCategory::Evaluation,
                    format!(
                        "{} evaluated, {} eligible, {} skipped{}",
                        coverage.candidates_evaluated,
                        coverage.eligible,
                        coverage.skipped,
                        if coverage.deadline_exceeded { " (deadline exceeded)" } else { "" }
                    ),
                )
                .with_protocol(protocol.as_str()),
            );
        }

        (protocol, result)
    }

    fn apply(&self, protocol: &str, terms: &LiquidationTerms, result: &mut ProtocolResult, message: Message) {
        match message {
            Message::Discovered { seen, selected, source } => {
                result.coverage.candidates_seen = seen;
                result.coverage.discovery = Some(source);
                self.events.emit(
                    ScanEvent::info(
                        EventCategory::Discovery,
                        format!("{} of {} candidates selected ({})", selected, seen, source.as_str()),
                    )
                    .with_protocol(protocol),
                );
            }
            Message::Unavailable(err) => {
                result.coverage.source_unavailable = true;
                self.emit_unavailable(protocol, &err.to_string());
            }
            Message::Healthy => result.coverage.candidates_evaluated += 1,
            Message::Eligible(evaluated) => {
                let Evaluated {
                    position,
                    best_quote,
                    venue_failures,
                } = *evaluated;
                result.coverage.candidates_evaluated += 1;
                result.coverage.eligible += 1;
                result.venue_failures.extend(venue_failures);

                debug!(
                    protocol,
                    user = %position.user,
                    ratio = %position.normalized_health_ratio,
                    quoted = best_quote.is_some(),
                    "Eligible position"
                );
                self.events.emit(
                    ScanEvent::info(
                        EventCategory::Evaluation,
                        format!("{} eligible at ratio {}", position.user, position.normalized_health_ratio),
                    )
                    .with_protocol(protocol),
                );
                if let Some(quote) = &best_quote {
                    self.events.emit(
                        ScanEvent::new(
                            EventLevel::Debug,
                            EventCategory::Quote,
                            format!(
                                "{} best route via {} ({} hops, out {})",
                                position.user,
                                quote.source_venue,
                                quote.hops(),
                                quote.amount_out
                            ),
                        )
                        .with_protocol(protocol),
                    );
                }
                result.eligible.push(EligiblePosition {
                    position,
                    terms: *terms,
                    best_quote,
                });
            }
            Message::Skipped { user, reason } => {
                result.coverage.skipped += 1;
                debug!(protocol, user = %user, reason = %reason, "Candidate skipped");
            }
            Message::LoadFailed { user, error } => {
                result.coverage.read_failures += 1;
                debug!(protocol, user = %user, error = %error, "Position read failed");
                if !result.coverage.source_unavailable {
                    result.coverage.source_unavailable = true;
                    self.emit_unavailable(protocol, &error.to_string());
                }
            }
            Message::Finished => result.finished = true,
            Message::DeadlineExceeded => {
                result.finished = true;
                result.coverage.deadline_exceeded = true;
                warn!(protocol, "Protocol deadline exceeded, keeping collected results");
            }
        }
    }

    fn emit_unavailable(&self, protocol: &str, reason: &str) {
        error!(protocol, reason, "Protocol source unavailable");
        self.events
            .emit(ScanEvent::error(format!("Source unavailable: {}", reason)).with_protocol(protocol));
    }
}

/// Swap of the seized collateral into the debt token.
///
/// Seizes `debt * close_factor * (1 + bonus)` worth of the largest collateral
/// line, capped at that line, and sells it for the largest debt token.
pub fn quote_request(position: &Position, terms: &LiquidationTerms) -> Option<QuoteRequest> {
    let (collateral, collateral_value) = position.largest_collateral()?;
    let (debt, _) = position.largest_debt()?;
    if collateral_value.is_zero() {
        return None;
    }

    let repay = apply_bps(position.debt_value_wad, terms.close_factor_bps);
    let seize = apply_bps_up(repay, terms.liquidation_bonus_bps);
    let seize = u256_math::min(seize, collateral_value);
    let amount_in = mul_div(collateral.amount.raw_amount, seize, collateral_value)?;

    Some(QuoteRequest::new(
        collateral.amount.token,
        debt.amount.token,
        amount_in,
        collateral.amount.decimals,
    ))
}

enum Message {
    Discovered {
        seen: usize,
        selected: usize,
        source: DiscoverySource,
    },
    Unavailable(ChainError),
    Healthy,
    Eligible(Box<Evaluated>),
    Skipped {
        user: Address,
        reason: String,
    },
    LoadFailed {
        user: Address,
        error: ChainError,
    },
    Finished,
    DeadlineExceeded,
}

struct Evaluated {
    position: Position,
    best_quote: Option<QuotePath>,
    venue_failures: Vec<(String, VenueError)>,
}

#[derive(Default)]
struct ProtocolResult {
    coverage: ProtocolCoverage,
    eligible: Vec<EligiblePosition>,
    venue_failures: Vec<(String, VenueError)>,
    finished: bool,
}

struct ProtocolTask {
    protocol: String,
    registration: ProtocolRegistration,
    quotes: Arc<QuoteAggregator>,
    phases: Arc<PhaseTracker>,
    window: BlockWindow,
    max_users: usize,
    call_timeout: Duration,
    concurrency: usize,
    deadline: Instant,
}

async fn run_protocol(task: Arc<ProtocolTask>, tx: mpsc::Sender<Message>) {
    let done = match timeout_at(task.deadline, produce(&task, &tx)).await {
        Ok(()) => Message::Finished,
        Err(_) => Message::DeadlineExceeded,
    };
    let _ = tx.send(done).await;
}

async fn produce(task: &Arc<ProtocolTask>, tx: &mpsc::Sender<Message>) {
    let adapter = task.registration.adapter.as_ref();

    if let Err(e) = adapter.probe(task.call_timeout).await {
        let _ = tx.send(Message::Unavailable(e)).await;
        return;
    }

    let discovered = match discover(
        adapter,
        task.registration.strategy,
        &task.registration.watch_list,
        task.window,
        task.max_users,
        task.call_timeout,
    )
    .await
    {
        Ok(discovered) => discovered,
        Err(e) => {
            let _ = tx.send(Message::Unavailable(e)).await;
            return;
        }
    };

    let message = Message::Discovered {
        seen: discovered.candidates_seen,
        selected: discovered.candidates.len(),
        source: discovered.source,
    };
    if tx.send(message).await.is_err() {
        return;
    }

    task.phases.set_protocol(&task.protocol, ProtocolPhase::Evaluating);
    let terms = adapter.liquidation_terms();
    let worker = task.clone();
    let mut results = stream::iter(discovered.candidates)
        .map(move |user| evaluate_candidate(worker.clone(), terms, user))
        .buffer_unordered(task.concurrency);

    while let Some(message) = results.next().await {
        if tx.send(message).await.is_err() {
            break;
        }
    }
}

async fn evaluate_candidate(task: Arc<ProtocolTask>, terms: LiquidationTerms, user: Address) -> Message {
    let mut raw = match task.registration.adapter.load_position(user, task.call_timeout).await {
        Ok(raw) => raw,
        Err(LoadError::Skipped(reason)) => return Message::Skipped { user, reason },
        Err(LoadError::SourceUnavailable(error)) => return Message::LoadFailed { user, error },
    };
    if raw.block_number == 0 {
        raw.block_number = task.window.to;
    }

    let position = health::evaluate(raw, Utc::now());
    if !position.is_eligible() {
        return Message::Healthy;
    }

    task.phases.set_protocol(&task.protocol, ProtocolPhase::Quoting);
    let outcome = match quote_request(&position, &terms) {
        Some(request) => task.quotes.best_quote(&request, task.call_timeout).await,
        None => QuoteOutcome::default(),
    };

    Message::Eligible(Box::new(Evaluated {
        position,
        best_quote: outcome.best,
        venue_failures: outcome.failures,
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake adapters and venues shared by orchestrator and service tests.

    use alloy::primitives::{Address, U256};
    use async_trait::async_trait;
    use scanner_api::{QuotePath, QuoteRequest, SwapVenue, VenueError};
    use scanner_chain::{
        AssetBalance, CandidateActivity, ChainError, DiscoveryMode, HealthInput, LiquidationTerms, LoadError,
        ProtocolAdapter, ProtocolKind, RawHealthMetric, RawPosition, TokenAmount,
    };
    use smallvec::smallvec;
    use std::collections::HashMap;
    use std::time::Duration;

    pub const COLLATERAL_TOKEN: Address = Address::new([0xaa; 20]);
    pub const DEBT_TOKEN: Address = Address::new([0xbb; 20]);

    pub fn user(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    /// Position worth `collateral` USD (80% threshold) against `debt` USD.
    pub fn raw_position(protocol: &str, user: Address, collateral: u64, debt: u64) -> RawPosition {
        let price = U256::from(100_000_000u64);
        RawPosition {
            protocol: protocol.to_string(),
            user,
            collateral: smallvec![AssetBalance::collateral(
                TokenAmount::new(COLLATERAL_TOKEN, U256::from(collateral) * U256::from(10u64).pow(U256::from(18)), 18),
                price,
                8,
                8_000,
            )],
            debt: smallvec![AssetBalance::debt(
                TokenAmount::new(DEBT_TOKEN, U256::from(debt) * U256::from(1_000_000u64), 6),
                price,
                8,
            )],
            health: HealthInput::Itemized,
            raw_health_metric: RawHealthMetric::Flag {
                liquidatable: collateral * 8 < debt * 10,
            },
            block_number: 0,
        }
    }

    #[derive(Debug)]
    pub struct FakeAdapter {
        pub id: String,
        pub mode: DiscoveryMode,
        pub probe_error: Option<ChainError>,
        pub activity: Vec<CandidateActivity>,
        pub positions: HashMap<Address, Result<RawPosition, LoadError>>,
        pub delays: HashMap<Address, Duration>,
    }

    impl FakeAdapter {
        pub fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                mode: DiscoveryMode::EventLogs,
                probe_error: None,
                activity: Vec::new(),
                positions: HashMap::new(),
                delays: HashMap::new(),
            }
        }

        /// Add an account seen at `block`, holding the given position.
        pub fn with_user(mut self, n: u8, block: u64, collateral: u64, debt: u64) -> Self {
            let account = user(n);
            self.activity.push(CandidateActivity {
                user: account,
                block_number: block,
                log_index: 0,
            });
            let position = raw_position(&self.id, account, collateral, debt);
            self.positions.insert(account, Ok(position));
            self
        }

        pub fn with_failure(mut self, n: u8, block: u64, error: LoadError) -> Self {
            let account = user(n);
            self.activity.push(CandidateActivity {
                user: account,
                block_number: block,
                log_index: 0,
            });
            self.positions.insert(account, Err(error));
            self
        }

        pub fn with_delay(mut self, n: u8, delay: Duration) -> Self {
            self.delays.insert(user(n), delay);
            self
        }
    }

    #[async_trait]
    impl ProtocolAdapter for FakeAdapter {
        fn protocol_id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> ProtocolKind {
            ProtocolKind::AaveV3
        }

        fn discovery_mode(&self) -> DiscoveryMode {
            self.mode
        }

        async fn probe(&self, _timeout: Duration) -> Result<(), ChainError> {
            match &self.probe_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn discover_candidates(
            &self,
            _from_block: u64,
            _to_block: u64,
            _timeout: Duration,
        ) -> Result<Vec<CandidateActivity>, ChainError> {
            Ok(self.activity.clone())
        }

        async fn load_position(&self, user: Address, _timeout: Duration) -> Result<RawPosition, LoadError> {
            if let Some(delay) = self.delays.get(&user) {
                tokio::time::sleep(*delay).await;
            }
            self.positions
                .get(&user)
                .cloned()
                .unwrap_or_else(|| Err(LoadError::Skipped("unknown account".to_string())))
        }

        fn liquidation_terms(&self) -> LiquidationTerms {
            LiquidationTerms::default()
        }
    }

    /// Venue converting 18-decimal input 1:1 into 6-decimal output.
    #[derive(Debug)]
    pub struct FakeVenue {
        pub id: String,
        pub error: Option<VenueError>,
    }

    impl FakeVenue {
        pub fn up(id: &str) -> Self {
            Self {
                id: id.to_string(),
                error: None,
            }
        }

        pub fn down(id: &str) -> Self {
            Self {
                id: id.to_string(),
                error: Some(VenueError::Unavailable("maintenance".to_string())),
            }
        }
    }

    #[async_trait]
    impl SwapVenue for FakeVenue {
        fn venue_id(&self) -> &str {
            &self.id
        }

        async fn quote(&self, request: &QuoteRequest, _timeout: Duration) -> Result<QuotePath, VenueError> {
            if let Some(e) = &self.error {
                return Err(e.clone());
            }
            Ok(QuotePath {
                source_venue: self.id.clone(),
                token_in: request.token_in,
                token_out: request.token_out,
                amount_in: request.amount_in,
                amount_out: request.amount_in / U256::from(1_000_000_000_000u64),
                route: vec![request.token_in, request.token_out],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::events::ChannelEventSink;
    use crate::ranker::RankingPolicy;
    use alloy::primitives::U256;
    use scanner_api::SwapVenue;
    use scanner_chain::{CandidateActivity, DiscoveryMode};

    fn scan_config(protocols: &[&str], venues: &[&str]) -> ScanConfig {
        ScanConfig {
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            max_users_per_protocol: 100,
            block_window: BlockWindow::new(1, 1_000),
            venues: venues.iter().map(|v| v.to_string()).collect(),
            per_call_timeout_ms: 1_000,
            per_protocol_deadline_ms: 5_000,
            concurrency: 4,
            grace_ms: 100,
            ranking_policy: RankingPolicy::RatioFirst,
        }
    }

    fn orchestrator(
        adapters: Vec<FakeAdapter>,
        venues: Vec<FakeVenue>,
    ) -> (ScanOrchestrator, mpsc::Receiver<ScanEvent>) {
        let (events, rx) = ChannelEventSink::new(1_024);
        let venues: Vec<Arc<dyn SwapVenue>> = venues
            .into_iter()
            .map(|v| Arc::new(v) as Arc<dyn SwapVenue>)
            .collect();
        let mut orchestrator = ScanOrchestrator::new(QuoteAggregator::new(venues), Arc::new(events));
        for adapter in adapters {
            orchestrator
                .register(ProtocolRegistration::new(Arc::new(adapter)))
                .unwrap();
        }
        (orchestrator, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_quote_request_sizes_seized_collateral() {
        let position = health::evaluate(raw_position("p", user(1), 100, 100), Utc::now());
        let request = quote_request(&position, &LiquidationTerms::default()).unwrap();
        assert_eq!(request.token_in, COLLATERAL_TOKEN);
        assert_eq!(request.token_out, DEBT_TOKEN);
        assert_eq!(request.decimals_in, 18);
        // 50% of 100 debt plus 5% bonus
        assert_eq!(request.amount_in, U256::from(525u64) * U256::from(10u64).pow(U256::from(17)));

        // Capped at the collateral line
        let small = health::evaluate(raw_position("p", user(1), 10, 100), Utc::now());
        let request = quote_request(&small, &LiquidationTerms::default()).unwrap();
        assert_eq!(request.amount_in, U256::from(10u64) * U256::from(10u64).pow(U256::from(18)));
    }

    #[tokio::test]
    async fn test_cycle_ranks_eligible_positions_with_quotes() {
        let adapter = FakeAdapter::new("lend")
            .with_user(1, 10, 200, 100) // 1.6
            .with_user(2, 11, 100, 100) // 0.8
            .with_user(3, 12, 50, 100); // 0.4
        let (orchestrator, mut rx) = orchestrator(vec![adapter], vec![FakeVenue::up("dex")]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &["dex"]), CancellationToken::new())
            .await
            .unwrap();

        let users: Vec<Address> = report.opportunities.iter().map(|o| o.user()).collect();
        assert_eq!(users, vec![user(3), user(2)]);
        assert!(report.opportunities.iter().all(|o| o.best_quote.is_some()));
        assert_eq!(report.opportunities[0].position.block_number, 1_000);

        let coverage = &report.per_protocol_coverage["lend"];
        assert_eq!(coverage.candidates_seen, 3);
        assert_eq!(coverage.candidates_evaluated, 3);
        assert_eq!(coverage.eligible, 2);
        assert_eq!(coverage.discovery, Some(DiscoverySource::Events));
        assert!(report.is_complete());
        assert!(report.unavailable_venues.is_empty());
        assert_eq!(orchestrator.phases().cycle(), CyclePhase::Completed);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.category == EventCategory::Discovery));
        assert_eq!(events.last().unwrap().category, EventCategory::CycleSummary);
    }

    #[tokio::test]
    async fn test_partial_failure_counts_skipped() {
        let mut adapter = FakeAdapter::new("lend");
        for n in 1..=10u8 {
            adapter = if n <= 3 {
                adapter.with_failure(n, n as u64, LoadError::Skipped("malformed reserve".to_string()))
            } else {
                adapter.with_user(n, n as u64, 100 + n as u64 * 10, 100)
            };
        }
        let (orchestrator, _rx) = orchestrator(vec![adapter], vec![]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &[]), CancellationToken::new())
            .await
            .unwrap();

        let coverage = &report.per_protocol_coverage["lend"];
        assert_eq!(coverage.candidates_seen, 10);
        assert_eq!(coverage.skipped, 3);
        assert_eq!(coverage.candidates_evaluated, 7);
        assert!(!coverage.source_unavailable);
        assert!(report.opportunities.iter().all(|o| o.best_quote.is_none()));
    }

    #[tokio::test]
    async fn test_overlapping_discovery_evaluates_once() {
        let mut adapter = FakeAdapter::new("lend").with_user(1, 10, 50, 100).with_user(2, 11, 50, 100);
        adapter.activity.push(CandidateActivity {
            user: user(1),
            block_number: 12,
            log_index: 4,
        });
        let (orchestrator, _rx) = orchestrator(vec![adapter], vec![]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &[]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.per_protocol_coverage["lend"].candidates_seen, 2);
        assert_eq!(report.per_protocol_coverage["lend"].candidates_evaluated, 2);
        assert_eq!(report.opportunities.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_protocol_is_bounded_by_deadline() {
        let slow = FakeAdapter::new("slow")
            .with_user(1, 100, 50, 100)
            .with_user(2, 99, 50, 100)
            .with_user(3, 50, 50, 100)
            .with_user(4, 49, 50, 100)
            .with_delay(3, Duration::from_secs(30))
            .with_delay(4, Duration::from_secs(30));
        let fast = FakeAdapter::new("fast").with_user(5, 1, 50, 100);
        let (orchestrator, _rx) = orchestrator(vec![slow, fast], vec![]);

        let config = ScanConfig {
            per_protocol_deadline_ms: 300,
            grace_ms: 100,
            concurrency: 1,
            ..scan_config(&["slow", "fast"], &[])
        };
        let started = std::time::Instant::now();
        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &config, CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));

        let slow = &report.per_protocol_coverage["slow"];
        assert!(slow.deadline_exceeded);
        assert_eq!(slow.candidates_evaluated, 2);
        let fast = &report.per_protocol_coverage["fast"];
        assert!(!fast.deadline_exceeded);
        assert_eq!(fast.candidates_evaluated, 1);

        assert!(!report.is_complete());
        assert_eq!(report.opportunities.len(), 3);
        assert_eq!(orchestrator.phases().protocol("slow"), Some(ProtocolPhase::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_unavailable_source_reported_once() {
        let mut down = FakeAdapter::new("down").with_user(1, 1, 50, 100);
        down.probe_error = Some(ChainError::Transport("connection refused".to_string()));
        let up = FakeAdapter::new("up").with_user(2, 1, 50, 100);
        let (orchestrator, mut rx) = orchestrator(vec![down, up], vec![]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["down", "up"], &[]), CancellationToken::new())
            .await
            .unwrap();

        assert!(report.per_protocol_coverage["down"].source_unavailable);
        assert_eq!(report.per_protocol_coverage["down"].candidates_evaluated, 0);
        assert_eq!(report.per_protocol_coverage["up"].candidates_evaluated, 1);
        assert_eq!(report.opportunities.len(), 1);

        let errors: Vec<ScanEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.category == EventCategory::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].protocol.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_all_reads_failing_marks_source_unavailable() {
        let adapter = FakeAdapter::new("lend")
            .with_failure(1, 1, LoadError::SourceUnavailable(ChainError::Timeout(Duration::from_secs(1))))
            .with_failure(2, 2, LoadError::SourceUnavailable(ChainError::Timeout(Duration::from_secs(1))));
        let (orchestrator, _rx) = orchestrator(vec![adapter], vec![]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &[]), CancellationToken::new())
            .await
            .unwrap();
        let coverage = &report.per_protocol_coverage["lend"];
        assert_eq!(coverage.skipped, 0);
        assert_eq!(coverage.read_failures, 2);
        assert!(coverage.source_unavailable);
    }

    #[tokio::test]
    async fn test_outage_mid_scan_reported_once() {
        let mut adapter = FakeAdapter::new("lend");
        for n in 1..=10u8 {
            adapter = if n % 2 == 0 {
                adapter.with_failure(
                    n,
                    n as u64,
                    LoadError::SourceUnavailable(ChainError::Transport("connection reset".to_string())),
                )
            } else {
                adapter.with_user(n, n as u64, 150, 100)
            };
        }
        let (orchestrator, mut rx) = orchestrator(vec![adapter], vec![]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &[]), CancellationToken::new())
            .await
            .unwrap();

        let coverage = &report.per_protocol_coverage["lend"];
        assert_eq!(coverage.candidates_evaluated, 5);
        assert_eq!(coverage.read_failures, 5);
        assert_eq!(coverage.skipped, 0);
        assert!(coverage.source_unavailable);
        assert!(!report.is_complete());
        assert_eq!(orchestrator.phases().protocol("lend"), Some(ProtocolPhase::Unavailable));

        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| e.category == EventCategory::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_unavailable_venue_reported_once() {
        let adapter = FakeAdapter::new("lend")
            .with_user(1, 1, 50, 100)
            .with_user(2, 2, 60, 100)
            .with_user(3, 3, 70, 100);
        let (orchestrator, mut rx) =
            orchestrator(vec![adapter], vec![FakeVenue::up("dex"), FakeVenue::down("broken")]);

        let report = orchestrator
            .run_cycle(
                ScanId::new_v4(),
                &scan_config(&["lend"], &["dex", "broken"]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.unavailable_venues, vec!["broken".to_string()]);
        assert!(report
            .opportunities
            .iter()
            .all(|o| o.best_quote.as_ref().map(|q| q.source_venue.as_str()) == Some("dex")));
        let venue_errors = drain(&mut rx)
            .into_iter()
            .filter(|e| e.category == EventCategory::Error && e.message.contains("broken"))
            .count();
        assert_eq!(venue_errors, 1);
    }

    #[tokio::test]
    async fn test_venue_subset_follows_config() {
        let adapter = FakeAdapter::new("lend").with_user(1, 1, 50, 100);
        let (orchestrator, _rx) =
            orchestrator(vec![adapter], vec![FakeVenue::up("dex"), FakeVenue::down("broken")]);

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &["dex"]), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.unavailable_venues.is_empty());
        assert!(report.opportunities[0].best_quote.is_some());
    }

    #[tokio::test]
    async fn test_two_cycles_produce_same_content() {
        let adapter = FakeAdapter::new("lend")
            .with_user(1, 5, 50, 100)
            .with_user(2, 6, 90, 100)
            .with_user(3, 7, 300, 100)
            .with_failure(4, 8, LoadError::Skipped("bad".to_string()));
        let (orchestrator, _rx) = orchestrator(vec![adapter], vec![FakeVenue::up("dex")]);
        let config = scan_config(&["lend"], &["dex"]);

        let first = orchestrator
            .run_cycle(ScanId::new_v4(), &config, CancellationToken::new())
            .await
            .unwrap();
        let second = orchestrator
            .run_cycle(ScanId::new_v4(), &config, CancellationToken::new())
            .await
            .unwrap();

        assert_ne!(first.scan_id, second.scan_id);
        assert!(first.same_content(&second));
    }

    #[tokio::test]
    async fn test_cancel_returns_error_without_report() {
        let adapter = FakeAdapter::new("lend")
            .with_user(1, 1, 50, 100)
            .with_delay(1, Duration::from_secs(30));
        let (orchestrator, _rx) = orchestrator(vec![adapter], vec![]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &[]), cancel)
            .await;
        assert_eq!(result, Err(ScanError::CycleCanceled));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(orchestrator.phases().cycle(), CyclePhase::Canceled);
    }

    #[tokio::test]
    async fn test_static_only_adapter_uses_watch_list() {
        let mut adapter = FakeAdapter::new("vaults").with_user(7, 1, 50, 100);
        adapter.mode = DiscoveryMode::StaticOnly;
        let (events, _rx) = ChannelEventSink::new(16);
        let mut orchestrator = ScanOrchestrator::new(QuoteAggregator::default(), Arc::new(events));
        orchestrator
            .register(ProtocolRegistration::new(Arc::new(adapter)).with_watch_list(vec![user(7), user(8)]))
            .unwrap();

        let report = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["vaults"], &[]), CancellationToken::new())
            .await
            .unwrap();
        let coverage = &report.per_protocol_coverage["vaults"];
        assert_eq!(coverage.discovery, Some(DiscoverySource::Static));
        assert_eq!(coverage.candidates_seen, 2);
        assert_eq!(coverage.candidates_evaluated, 1);
        assert_eq!(coverage.skipped, 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_unknown_ids() {
        let (orchestrator, _rx) = orchestrator(vec![FakeAdapter::new("lend")], vec![FakeVenue::up("dex")]);

        let unknown_protocol = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["other"], &[]), CancellationToken::new())
            .await;
        assert!(matches!(unknown_protocol, Err(ScanError::Configuration(_))));

        let unknown_venue = orchestrator
            .run_cycle(ScanId::new_v4(), &scan_config(&["lend"], &["nope"]), CancellationToken::new())
            .await;
        assert!(matches!(unknown_venue, Err(ScanError::Configuration(_))));
        assert_eq!(orchestrator.phases().cycle(), CyclePhase::Idle);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (mut orchestrator, _rx) = orchestrator(vec![FakeAdapter::new("lend")], vec![]);
        let again = orchestrator.register(ProtocolRegistration::new(Arc::new(FakeAdapter::new("lend"))));
        assert!(matches!(again, Err(ScanError::Configuration(_))));
        assert_eq!(orchestrator.protocol_ids().collect::<Vec<_>>(), vec!["lend"]);
    }
}
