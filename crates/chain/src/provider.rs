//! JSON-RPC implementation of the chain access port.
//! Uses Alloy HTTP providers; every request is bounded by its own timeout.

use crate::port::{ChainError, ChainReader, LogEntry, LogQuery};
use alloy::primitives::{Address, Bytes};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionInput, TransactionRequest};
use alloy::transports::{RpcError, TransportErrorKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// JSON-RPC error code used by nodes for execution reverts.
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Chain reader backed by an Alloy provider.
#[derive(Clone)]
pub struct RpcChainReader<P> {
    provider: P,
    url: String,
}

impl RpcChainReader<()> {
    /// Connect to an HTTP JSON-RPC endpoint.
    pub fn http(url: &str) -> Result<RpcChainReader<impl Provider + Clone + 'static>> {
        let parsed = url
            .parse()
            .with_context(|| format!("Invalid RPC URL '{}'", url))?;
        let provider = ProviderBuilder::new().on_http(parsed);

        info!(url = url, "Initialized JSON-RPC chain reader");

        Ok(RpcChainReader {
            provider,
            url: url.to_string(),
        })
    }
}

impl<P: Provider + 'static> RpcChainReader<P> {
    /// Wrap an existing provider.
    pub fn with_provider(provider: P, url: impl Into<String>) -> Self {
        Self {
            provider,
            url: url.into(),
        }
    }

    /// Endpoint this reader talks to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check that the endpoint answers.
    pub async fn health_check(&self, timeout: Duration) -> Result<u64, ChainError> {
        let block = self.block_number(timeout).await?;
        debug!(block = block, "Chain reader health check passed");
        Ok(block)
    }
}

impl<P> fmt::Debug for RpcChainReader<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChainReader")
            .field("url", &self.url)
            .finish()
    }
}

/// Run an RPC future under a timeout and classify its error.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, ChainError>
where
    F: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(ChainError::Timeout(timeout)),
    }
}

/// Map a transport error onto the port's error taxonomy.
fn classify(err: RpcError<TransportErrorKind>) -> ChainError {
    if let Some(resp) = err.as_error_resp() {
        let message = resp.message.to_string();
        if resp.code == EXECUTION_REVERTED_CODE || message.to_lowercase().contains("revert") {
            return ChainError::Revert(message);
        }
        return ChainError::Transport(format!("rpc error {}: {}", resp.code, message));
    }
    match err {
        RpcError::DeserError { err, .. } => ChainError::Decode(err.to_string()),
        other => ChainError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<P: Provider + 'static> ChainReader for RpcChainReader<P> {
    async fn call_view(
        &self,
        to: Address,
        calldata: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(calldata));
        bounded(timeout, async { self.provider.call(tx).await }).await
    }

    async fn get_logs(
        &self,
        query: LogQuery,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>, ChainError> {
        let filter = Filter::new()
            .address(query.address)
            .event_signature(query.topic0.clone())
            .from_block(query.from_block)
            .to_block(query.to_block);

        let logs = bounded(timeout, self.provider.get_logs(&filter)).await?;

        debug!(
            address = %query.address,
            from = query.from_block,
            to = query.to_block,
            count = logs.len(),
            "Fetched logs"
        );

        Ok(logs
            .into_iter()
            .map(|log| LogEntry {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number: log.block_number.unwrap_or_default(),
                log_index: log.log_index.unwrap_or_default(),
            })
            .collect())
    }

    async fn block_number(&self, timeout: Duration) -> Result<u64, ChainError> {
        bounded(timeout, async { self.provider.get_block_number().await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RpcChainReader::http("not a url").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_public_endpoint_block_number() {
        let reader = RpcChainReader::http("https://eth.llamarpc.com").unwrap();
        let block = reader.block_number(Duration::from_secs(10)).await.unwrap();
        assert!(block > 0);
    }
}
