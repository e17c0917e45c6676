//! Chain access port.
//!
//! Every read the scanner performs against a chain goes through
//! [`ChainReader`]. All operations are side-effect free and carry their own
//! timeout; retries are bounded. Adapters read through a [`RetryingReader`]
//! so view calls are retried under the deployment's [`RetryPolicy`], and log
//! scans retry per chunk in [`scan_logs_chunked`].

use alloy::primitives::{Address, Bytes, B256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the chain access port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The read did not complete within its timeout.
    #[error("chain read timed out after {0:?}")]
    Timeout(Duration),
    /// The call executed and reverted.
    #[error("call reverted: {0}")]
    Revert(String),
    /// The node could not be reached or returned a transport-level error.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ChainError {
    /// Whether this error indicates the source itself is unreachable, as
    /// opposed to a failure specific to one call.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// A single view call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewCall {
    /// Contract address
    pub to: Address,
    /// ABI-encoded calldata
    pub calldata: Bytes,
}

/// Log filter for a single contract and block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Emitting contract
    pub address: Address,
    /// Accepted event signatures (topic 0); empty matches all
    pub topic0: Vec<B256>,
    /// First block (inclusive)
    pub from_block: u64,
    /// Last block (inclusive)
    pub to_block: u64,
}

/// Decoded-enough log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Emitting contract
    pub address: Address,
    /// Topics (topic 0 is the event signature)
    pub topics: Vec<B256>,
    /// Non-indexed data
    pub data: Bytes,
    /// Block number
    pub block_number: u64,
    /// Log index within the block
    pub log_index: u64,
}

/// Read access to contract state and logs.
#[async_trait]
pub trait ChainReader: Send + Sync + Debug {
    /// Execute a view call and return the raw return data.
    async fn call_view(
        &self,
        to: Address,
        calldata: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ChainError>;

    /// Fetch logs for one contract over an inclusive block range.
    async fn get_logs(&self, query: LogQuery, timeout: Duration)
        -> Result<Vec<LogEntry>, ChainError>;

    /// Current block number.
    async fn block_number(&self, timeout: Duration) -> Result<u64, ChainError>;

    /// Execute several view calls. Results are returned in call order.
    ///
    /// The default fans the calls out concurrently; implementations backed by
    /// a multicall contract may override it.
    async fn batch_call(
        &self,
        calls: Vec<ViewCall>,
        timeout: Duration,
    ) -> Vec<Result<Bytes, ChainError>> {
        join_all(
            calls
                .into_iter()
                .map(|call| self.call_view(call.to, call.calldata, timeout)),
        )
        .await
    }
}

/// Execute a typed `sol!` call through the port and decode its return value.
pub async fn call_typed<C: SolCall>(
    reader: &dyn ChainReader,
    to: Address,
    call: &C,
    timeout: Duration,
) -> Result<C::Return, ChainError> {
    let data = reader
        .call_view(to, Bytes::from(call.abi_encode()), timeout)
        .await?;
    C::abi_decode_returns(&data, true).map_err(|e| ChainError::Decode(e.to_string()))
}

/// Retry policy for port reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (1 = no retry)
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Read settings shared by all adapters of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum blocks per `eth_getLogs` request
    pub log_chunk_blocks: u64,
    /// Retry policy for systemic failures
    pub retry: RetryPolicy,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            log_chunk_blocks: 2_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-systemic error, or the
/// attempt budget is spent. Reverts are never retried.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_systemic() && attempt < policy.attempts => {
                debug!(attempt, error = %e, "Retrying chain read");
                attempt += 1;
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reader that retries systemic view-call and block-number failures.
///
/// Log reads pass straight through; [`scan_logs_chunked`] retries them per
/// chunk so a failure does not restart the whole window.
#[derive(Debug)]
pub struct RetryingReader {
    inner: Arc<dyn ChainReader>,
    policy: RetryPolicy,
}

impl RetryingReader {
    /// Wrap `inner`; a single-attempt policy returns it unchanged.
    pub fn wrap(inner: Arc<dyn ChainReader>, policy: RetryPolicy) -> Arc<dyn ChainReader> {
        if policy.attempts <= 1 {
            return inner;
        }
        Arc::new(Self { inner, policy })
    }
}

#[async_trait]
impl ChainReader for RetryingReader {
    async fn call_view(
        &self,
        to: Address,
        calldata: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ChainError> {
        with_retries(self.policy, || self.inner.call_view(to, calldata.clone(), timeout)).await
    }

    async fn get_logs(&self, query: LogQuery, timeout: Duration)
        -> Result<Vec<LogEntry>, ChainError> {
        self.inner.get_logs(query, timeout).await
    }

    async fn block_number(&self, timeout: Duration) -> Result<u64, ChainError> {
        with_retries(self.policy, || self.inner.block_number(timeout)).await
    }
}

/// Fetch logs over `[from_block, to_block]` in chunks of at most
/// `chunk_blocks` blocks, retrying each chunk under `policy`.
pub async fn scan_logs_chunked(
    reader: &dyn ChainReader,
    address: Address,
    topic0: &[B256],
    from_block: u64,
    to_block: u64,
    chunk_blocks: u64,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<Vec<LogEntry>, ChainError> {
    let chunk_blocks = chunk_blocks.max(1);
    let mut logs = Vec::new();
    let mut start = from_block;

    while start <= to_block {
        let end = start.saturating_add(chunk_blocks - 1).min(to_block);
        let query = LogQuery {
            address,
            topic0: topic0.to_vec(),
            from_block: start,
            to_block: end,
        };
        let chunk = with_retries(policy, || reader.get_logs(query.clone(), timeout)).await?;
        logs.extend(chunk);

        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }

    Ok(logs)
}
