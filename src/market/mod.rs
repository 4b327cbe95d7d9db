// Market data collaborator and last-known price book
pub mod http;

pub use http::HttpMarketData;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::{timeout, Duration};

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn current_price(&self, ticker: &str) -> anyhow::Result<f64>;
}

/// Quotes with a bounded wait and a memory of the last good price.
///
/// A failed or invalid quote degrades to the last-known price; valuation
/// degrades further to the caller's fallback (usually average entry). It never
/// yields zero and never returns an error.
pub struct PriceBook {
    source: Option<Arc<dyn MarketData>>,
    quote_timeout: Duration,
    last_known: RwLock<HashMap<String, f64>>,
}

impl PriceBook {
    pub fn new(source: Option<Arc<dyn MarketData>>, quote_timeout: Duration) -> Self {
        Self {
            source,
            quote_timeout,
            last_known: RwLock::new(HashMap::new()),
        }
    }

    /// Book without a live feed; only fills and seeded prices are known
    pub fn offline() -> Self {
        Self::new(None, Duration::from_secs(1))
    }

    /// Fresh quote if the feed answers in time, else the last known price
    pub async fn quote(&self, ticker: &str) -> Option<f64> {
        if let Some(source) = &self.source {
            match timeout(self.quote_timeout, source.current_price(ticker)).await {
                Ok(Ok(price)) if price.is_finite() && price > 0.0 => {
                    self.record(ticker, price);
                    return Some(price);
                }
                Ok(Ok(price)) => {
                    tracing::warn!("Ignoring invalid quote {} for {}", price, ticker);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Price feed failed for {}: {:#}", ticker, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Price feed timed out for {} after {:?}",
                        ticker,
                        self.quote_timeout
                    );
                }
            }
        }

        let last = self.last_known(ticker);
        if last.is_some() {
            tracing::debug!("Using last known price for {}", ticker);
        }
        last
    }

    /// Quote every ticker concurrently so later valuations see fresh prices
    pub async fn refresh<'a>(&self, tickers: impl IntoIterator<Item = &'a str>) {
        join_all(tickers.into_iter().map(|ticker| self.quote(ticker))).await;
    }

    /// Price for valuation: last known, else `fallback`. Never touches the feed.
    pub fn valuation_price(&self, ticker: &str, fallback: f64) -> f64 {
        self.last_known(ticker).unwrap_or(fallback)
    }

    pub fn last_known(&self, ticker: &str) -> Option<f64> {
        self.last_known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ticker)
            .copied()
    }

    pub fn record(&self, ticker: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.last_known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticker.to_string(), price);
    }

    pub fn seed(&self, prices: HashMap<String, f64>) {
        for (ticker, price) in prices {
            self.record(&ticker, price);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.last_known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
