//! Uniswap V2-style router venue (Uniswap V2, Sushiswap, and forks).

use super::{QuotePath, QuoteRequest, SwapVenue, VenueError};
use alloy::primitives::{Address, U256};
use alloy::sol;
use async_trait::async_trait;
use futures::future::join_all;
use scanner_chain::{call_typed, ChainReader};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

sol! {
    interface IUniswapV2Router {
        function getAmountsOut(uint256 amountIn, address[] calldata path)
            external view returns (uint256[] memory amounts);
    }
}

/// Router `getAmountsOut` venue.
#[derive(Debug)]
pub struct UniswapV2Venue {
    id: String,
    router: Address,
    reader: Arc<dyn ChainReader>,
    connectors: Vec<Address>,
}

impl UniswapV2Venue {
    pub fn new(id: impl Into<String>, router: Address, reader: Arc<dyn ChainReader>) -> Self {
        Self {
            id: id.into(),
            router,
            reader,
            connectors: Vec::new(),
        }
    }

    pub fn with_connectors(mut self, connectors: Vec<Address>) -> Self {
        self.connectors = connectors;
        self
    }

    fn candidate_paths(&self, request: &QuoteRequest) -> Vec<Vec<Address>> {
        let mut paths = vec![vec![request.token_in, request.token_out]];
        paths.extend(
            self.connectors
                .iter()
                .filter(|c| **c != request.token_in && **c != request.token_out)
                .map(|c| vec![request.token_in, *c, request.token_out]),
        );
        paths
    }

    async fn amount_out(&self, amount_in: U256, path: Vec<Address>, timeout: Duration) -> Result<U256, VenueError> {
        let call = IUniswapV2Router::getAmountsOutCall {
            amountIn: amount_in,
            path,
        };
        let ret = call_typed(self.reader.as_ref(), self.router, &call, timeout).await?;
        ret.amounts
            .last()
            .copied()
            .ok_or_else(|| VenueError::Unavailable("empty amounts".to_string()))
    }
}

#[async_trait]
impl SwapVenue for UniswapV2Venue {
    fn venue_id(&self) -> &str {
        &self.id
    }

    async fn quote(&self, request: &QuoteRequest, timeout: Duration) -> Result<QuotePath, VenueError> {
        let paths = self.candidate_paths(request);
        let results = join_all(
            paths
                .iter()
                .map(|path| self.amount_out(request.amount_in, path.clone(), timeout)),
        )
        .await;

        let mut best: Option<(U256, &Vec<Address>)> = None;
        let mut last_error = VenueError::NoRoute;
        // Paths are ordered by length, so a strict comparison keeps the shorter
        // path at equal output.
        for (path, result) in paths.iter().zip(results) {
            match result {
                Ok(out) if !out.is_zero() && best.map_or(true, |(b, _)| out > b) => {
                    best = Some((out, path));
                }
                Ok(_) => {}
                Err(VenueError::NoRoute) => {
                    debug!(venue = %self.id, hops = path.len() - 1, "Path has no liquidity");
                }
                Err(e) => last_error = e,
            }
        }

        let (amount_out, route) = best.ok_or(last_error)?;
        Ok(QuotePath {
            source_venue: self.id.clone(),
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out,
            route: route.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;
    use alloy::sol_types::SolCall;
    use scanner_chain::{ChainError, LogEntry, LogQuery};

    const ROUTER: Address = Address::new([0x77; 20]);
    const DAI: Address = Address::new([0x01; 20]);
    const WETH: Address = Address::new([0x02; 20]);
    const LINK: Address = Address::new([0x03; 20]);

    /// Direct LINK->DAI pays 90%, through WETH pays 95%.
    #[derive(Debug)]
    struct RouterReader;

    #[async_trait]
    impl ChainReader for RouterReader {
        async fn call_view(&self, _to: Address, calldata: Bytes, _t: Duration) -> Result<Bytes, ChainError> {
            let call = IUniswapV2Router::getAmountsOutCall::abi_decode(&calldata, true)
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            let rate = match call.path.len() {
                2 => 9_000u64,
                3 => 9_500u64,
                _ => return Err(ChainError::Revert("INVALID_PATH".into())),
            };
            let mut amounts = vec![call.amountIn; call.path.len() - 1];
            amounts.push(call.amountIn * U256::from(rate) / U256::from(10_000u64));
            Ok(IUniswapV2Router::getAmountsOutCall::abi_encode_returns(&(amounts,)).into())
        }

        async fn get_logs(&self, _q: LogQuery, _t: Duration) -> Result<Vec<LogEntry>, ChainError> {
            Ok(Vec::new())
        }

        async fn block_number(&self, _t: Duration) -> Result<u64, ChainError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_connector_path_wins_when_better() {
        let venue = UniswapV2Venue::new("sushi", ROUTER, Arc::new(RouterReader)).with_connectors(vec![WETH]);
        let quote = venue
            .quote(&QuoteRequest::new(LINK, DAI, U256::from(1_000u64), 18), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(quote.amount_out, U256::from(950u64));
        assert_eq!(quote.route, vec![LINK, WETH, DAI]);
    }

    #[tokio::test]
    async fn test_direct_only_without_connectors() {
        let venue = UniswapV2Venue::new("sushi", ROUTER, Arc::new(RouterReader));
        let quote = venue
            .quote(&QuoteRequest::new(LINK, DAI, U256::from(1_000u64), 18), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(quote.amount_out, U256::from(900u64));
        assert_eq!(quote.hops(), 1);
    }
}
