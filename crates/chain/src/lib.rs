//! Scanner chain access layer.
//!
//! This crate provides:
//! - The chain access port ([`ChainReader`]) with timeouts, bounded retries and chunked log scans
//! - An Alloy JSON-RPC implementation of the port
//! - Protocol-agnostic position records
//! - Protocol adapters for AAVE V3, comptroller forks, Compound V3 and Vat-style CDPs
//!
//! Every adapter is read-only; nothing in this crate signs or sends transactions.

mod port;
pub mod protocol;
mod provider;
mod types;

pub use port::{
    call_typed, scan_logs_chunked, with_retries, ChainError, ChainReader, LogEntry, LogQuery,
    ReadOptions, RetryPolicy, RetryingReader, ViewCall,
};
pub use protocol::{
    CandidateActivity, DiscoveryMode, LiquidationTerms, LoadError, ProtocolAdapter,
    ProtocolFactory, ProtocolKind, ProtocolSpec,
};
pub use provider::RpcChainReader;
pub use types::{AssetBalance, HealthInput, RawHealthMetric, RawPosition, TokenAmount};
