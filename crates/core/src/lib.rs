//! Position scanner core logic.
//!
//! This crate provides:
//! - WAD fixed-point math and the health evaluation engine
//! - Candidate discovery from event logs and watch-lists
//! - Opportunity ranking and deduplication
//! - Scan cycle orchestration with deadlines, cancellation and partial-failure tolerance
//! - Scan reports, structured scan events and the scanner lifecycle service
//!
//! Protocol adapters live in `scanner-chain`, swap venues in `scanner-api`.

pub mod config;
mod discovery;
mod error;
mod events;
pub mod health;
mod phase;
mod position;
mod ranker;
mod report;
mod scanner;
mod service;
pub mod u256_math;

pub use config::{load_settings, ScanConfig, ScannerSettings};
pub use discovery::{BlockWindow, DiscoverySource, DiscoveryStrategy};
pub use error::{ScanError, ScanId};
pub use events::{
    ChannelEventSink, EventCategory, EventLevel, EventSink, FanoutEventSink, ScanEvent, TracingEventSink,
};
pub use phase::{CyclePhase, PhaseSnapshot, PhaseTracker, ProtocolPhase};
pub use position::{HealthRatio, Opportunity, Position};
pub use ranker::{extractable_value, rank, urgency_score, EligiblePosition, RankingPolicy};
pub use report::{ChannelReportSink, JsonStdoutSink, LogReportSink, ProtocolCoverage, ReportSink, ScanReport};
pub use scanner::{quote_request, ProtocolRegistration, ScanOrchestrator};
pub use service::{ScannerService, ServiceStatus};
