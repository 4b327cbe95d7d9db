use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{SignalReport, SignalSource};

// Type alias for the rate limiter to simplify signatures
type SourceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Signal source served over HTTP: `GET {base_url}/signal/{ticker}`.
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct HttpSignalSource {
    id: String,
    base_url: String,
    client: Client,
    rate_limiter: Arc<SourceRateLimiter>,
}

impl HttpSignalSource {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        requests_per_minute: u32,
    ) -> Result<Self> {
        // Hard ceiling; the aggregator's per-source timeout is normally tighter
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn get_signal(&self, ticker: &str) -> Result<SignalReport> {
        let url = format!("{}/signal/{}", self.base_url, ticker);

        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Signal source {} returned {}: {}", self.id, status, error_text);
        }

        response
            .json::<SignalReport>()
            .await
            .with_context(|| format!("Invalid signal payload from {}", self.id))
    }
}
