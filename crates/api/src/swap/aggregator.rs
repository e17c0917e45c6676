//! Concurrent best-output quoting across venues.

use super::{QuotePath, QuoteRequest, SwapVenue, VenueError};
use futures::future::join_all;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of one aggregated quote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteOutcome {
    /// Best quote, if any venue produced a usable one
    pub best: Option<QuotePath>,
    /// Venues that failed, with the reason
    pub failures: Vec<(String, VenueError)>,
}

/// Fans a quote request out to every configured venue.
#[derive(Debug, Clone, Default)]
pub struct QuoteAggregator {
    venues: Vec<Arc<dyn SwapVenue>>,
}

impl QuoteAggregator {
    pub fn new(venues: Vec<Arc<dyn SwapVenue>>) -> Self {
        Self { venues }
    }

    /// Aggregator over the venues whose id is accepted by `keep`.
    pub fn subset(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            venues: self
                .venues
                .iter()
                .filter(|v| keep(v.venue_id()))
                .cloned()
                .collect(),
        }
    }

    pub fn venue_ids(&self) -> Vec<String> {
        self.venues.iter().map(|v| v.venue_id().to_string()).collect()
    }

    /// Query all venues concurrently, each bounded by `timeout`, and pick the
    /// best quote.
    ///
    /// Selection: greatest output, then fewer hops, then the smallest venue id.
    /// Zero outputs and quotes for a different pair are discarded.
    pub async fn best_quote(&self, request: &QuoteRequest, timeout: Duration) -> QuoteOutcome {
        if !request.is_quotable() || self.venues.is_empty() {
            return QuoteOutcome::default();
        }

        let results = join_all(self.venues.iter().map(|venue| async move {
            let result = match tokio::time::timeout(timeout, venue.quote(request, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(VenueError::Timeout(timeout)),
            };
            (venue.venue_id().to_string(), result)
        }))
        .await;

        let mut outcome = QuoteOutcome::default();
        let mut candidates = Vec::new();

        for (venue_id, result) in results {
            match result {
                Ok(path) if path.amount_out.is_zero() => {
                    debug!(venue = %venue_id, "Discarding zero-output quote");
                }
                Ok(path) if path.token_in != request.token_in || path.token_out != request.token_out => {
                    debug!(venue = %venue_id, "Discarding quote for a different pair");
                }
                Ok(path) => candidates.push(path),
                Err(e) => {
                    debug!(venue = %venue_id, error = %e, "Venue produced no quote");
                    outcome.failures.push((venue_id, e));
                }
            }
        }

        candidates.sort_by(compare_quotes);
        outcome.best = candidates.into_iter().next();
        outcome
    }
}

/// Total order on quotes: better quotes sort first.
fn compare_quotes(a: &QuotePath, b: &QuotePath) -> Ordering {
    b.amount_out
        .cmp(&a.amount_out)
        .then_with(|| a.hops().cmp(&b.hops()))
        .then_with(|| a.source_venue.cmp(&b.source_venue))
}
