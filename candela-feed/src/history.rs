//! REST history backfill.
//!
//! Fetches recent candles for a `(symbol, resolution)` pair so the chart
//! opens populated before the live stream takes over. Backfilled candles
//! flow through the same validation as live ones.

use crate::{error::FeedError, protocol::WireCandle};
use candela_chart::candle::{Candle, Resolution};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the venue's candle history endpoint.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HistoryClient {
    /// Validate the base URL and build the client.
    pub fn new(base_url: impl Into<String>) -> Result<Self, FeedError> {
        let base_url = base_url.into();
        Url::parse(&base_url)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }

    /// Fetch up to `limit` recent candles, returned valid and ascending.
    pub async fn recent_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!(
            "{}/candles?symbol={}&resolution={}&limit={}",
            self.base_url,
            symbol,
            resolution.as_str(),
            limit
        );
        debug!("Fetching candle history from {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::Http(format!(
                "history request returned status {}",
                response.status()
            )));
        }

        let wire: Vec<WireCandle> = response.json().await?;
        Ok(sanitize(symbol, wire))
    }
}

/// Drop malformed bars and restore ascending timestamp order.
///
/// Duplicated timestamps keep their first occurrence; the live stream's
/// `upsert` path owns revisions of the open bar.
fn sanitize(symbol: &str, wire: Vec<WireCandle>) -> Vec<Candle> {
    let total = wire.len();
    let mut candles: Vec<Candle> = wire
        .iter()
        .map(Candle::from)
        .filter(|candle| candle.is_valid())
        .collect();
    candles.sort_by_key(|candle| candle.timestamp);
    candles.dedup_by_key(|candle| candle.timestamp);

    if candles.len() < total {
        warn!(
            "Dropped {} malformed or duplicated history bar(s) for {}",
            total - candles.len(),
            symbol
        );
    }
    candles
}
