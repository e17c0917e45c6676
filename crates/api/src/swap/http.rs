//! HTTP route API venue.
//!
//! Queries an aggregator exposing `GET {base}/v2/route` and maps the route to
//! a [`QuotePath`]. Responses are cached for a short TTL keyed by the pair and
//! a logarithmic amount bucket.

use super::{QuotePath, QuoteRequest, SwapVenue, VenueError};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Cached quote with timestamp for TTL expiration.
#[derive(Clone)]
struct CachedQuote {
    path: QuotePath,
    cached_at: Instant,
}

/// Cache key for quotes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    token_in: Address,
    token_out: Address,
    /// Bucketed amount (rounded to reduce cache misses)
    amount_bucket: u64,
}

/// REST route API venue with caching.
pub struct HttpRouteVenue {
    id: String,
    client: reqwest::Client,
    base_url: String,
    cache: DashMap<CacheKey, CachedQuote>,
    /// Cache TTL (default: 5 seconds)
    cache_ttl: Duration,
}

impl std::fmt::Debug for HttpRouteVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRouteVenue")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("cache_size", &self.cache.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl HttpRouteVenue {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(5),
        }
    }

    /// Create with custom cache TTL.
    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Bucket amount by order of magnitude (hundredths of a decade).
    fn bucket_amount(amount: U256) -> u64 {
        if amount.is_zero() {
            return 0;
        }
        let approx: f64 = amount.to_string().parse().unwrap_or(f64::MAX);
        (approx.log10() * 100.0) as u64
    }

    /// Format raw token amount to human-readable string.
    fn format_amount(amount: U256, decimals: u8) -> String {
        let divisor = U256::from(10u64).pow(U256::from(decimals));
        let whole = amount / divisor;
        let frac = amount % divisor;

        if frac.is_zero() {
            return whole.to_string();
        }
        let frac_str = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
        format!("{}.{}", whole, frac_str.trim_end_matches('0'))
    }

    /// Fetch route from the API.
    #[instrument(skip(self, request), fields(venue = %self.id, token_in = %request.token_in, token_out = %request.token_out))]
    async fn fetch_route(&self, request: &QuoteRequest) -> Result<QuotePath, VenueError> {
        let url = format!("{}/v2/route", self.base_url);
        let amount_human = Self::format_amount(request.amount_in, request.decimals_in);

        debug!(amount = %amount_human, "Requesting route");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("tokenIn", format!("{}", request.token_in).to_lowercase()),
                ("tokenOut", format!("{}", request.token_out).to_lowercase()),
                ("amountIn", amount_human),
                ("multiHop", "true".to_string()),
            ])
            .send()
            .await
            .map_err(|e| VenueError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VenueError::Unavailable(format!("API error: {} - {}", status, body)));
        }

        let api_response: RouteApiResponse = response
            .json()
            .await
            .map_err(|e| VenueError::Unavailable(format!("malformed response: {}", e)))?;
        self.convert_response(request, api_response)
    }

    /// Convert API response to a quote.
    fn convert_response(
        &self,
        request: &QuoteRequest,
        response: RouteApiResponse,
    ) -> Result<QuotePath, VenueError> {
        if !response.success {
            let msg = response.message.unwrap_or_default();
            debug!(venue = %self.id, message = %msg, "API reported no route");
            return Err(VenueError::NoRoute);
        }

        let execution = response.execution.ok_or(VenueError::NoRoute)?;
        let amount_out: U256 = execution
            .details
            .amount_out
            .parse()
            .map_err(|_| VenueError::Unavailable("unparseable amountOut".to_string()))?;

        let mut route: Vec<Address> = execution
            .details
            .path
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if route.first() != Some(&request.token_in) || route.last() != Some(&request.token_out) {
            route = vec![request.token_in, request.token_out];
        }

        Ok(QuotePath {
            source_venue: self.id.clone(),
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out,
            route,
        })
    }

    /// Cache a fresh route, dropping expired entries first so the map only
    /// holds quotes still inside the TTL.
    fn store(&self, key: CacheKey, path: QuotePath) {
        self.cache
            .retain(|_, cached| cached.cached_at.elapsed() < self.cache_ttl);
        self.cache.insert(
            key,
            CachedQuote {
                path,
                cached_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl SwapVenue for HttpRouteVenue {
    fn venue_id(&self) -> &str {
        &self.id
    }

    async fn quote(&self, request: &QuoteRequest, timeout: Duration) -> Result<QuotePath, VenueError> {
        let cache_key = CacheKey {
            token_in: request.token_in,
            token_out: request.token_out,
            amount_bucket: Self::bucket_amount(request.amount_in),
        };

        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.cached_at.elapsed() < self.cache_ttl && cached.path.amount_in == request.amount_in {
                debug!(
                    venue = %self.id,
                    cache_age_ms = cached.cached_at.elapsed().as_millis() as u64,
                    "Cache hit for route"
                );
                return Ok(cached.path.clone());
            }
        }

        let path = tokio::time::timeout(timeout, self.fetch_route(request))
            .await
            .map_err(|_| VenueError::Timeout(timeout))??;

        self.store(cache_key, path.clone());
        Ok(path)
    }
}

// API response types

#[derive(Debug, Deserialize)]
struct RouteApiResponse {
    success: bool,
    execution: Option<ExecutionInfo>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionInfo {
    details: ExecutionDetails,
}

#[derive(Debug, Deserialize)]
struct ExecutionDetails {
    #[serde(default)]
    path: Vec<String>,
    #[serde(rename = "amountOut")]
    amount_out: String,
}
