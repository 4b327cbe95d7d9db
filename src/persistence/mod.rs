use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPrice {
    price: f64,
    timestamp: DateTime<Utc>,
}

/// Redis cache of last-known prices, so valuation survives restarts while
/// the market feed is down.
///
/// One hash per account: `prices:{account}` with a field per ticker. This is
/// a cache, not the ledger; losing it only degrades valuation to entry prices.
pub struct RedisPriceCache {
    conn: ConnectionManager,
}

impl RedisPriceCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Invalid Redis URL")?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow::anyhow!("Redis connection timeout after 5 seconds"))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(account_id: &str) -> String {
        format!("prices:{}", account_id)
    }

    /// Save prices, overwriting older entries for the same tickers
    pub async fn save_prices(
        &mut self,
        account_id: &str,
        prices: &HashMap<String, f64>,
    ) -> Result<()> {
        if prices.is_empty() {
            return Ok(());
        }

        let key = Self::key(account_id);
        let now = Utc::now();

        let mut entries = Vec::with_capacity(prices.len());
        for (ticker, &price) in prices {
            let value = serde_json::to_string(&StoredPrice {
                price,
                timestamp: now,
            })?;
            entries.push((ticker.clone(), value));
        }

        self.conn
            .hset_multiple::<_, _, _, ()>(&key, &entries)
            .await?;

        tracing::debug!("Cached {} prices for {} in Redis", entries.len(), account_id);

        Ok(())
    }

    /// Load cached prices
    ///
    /// # Arguments
    /// * `account_id` - Account the prices were saved for
    /// * `max_age` - Entries older than this are skipped; `None` keeps all
    pub async fn load_prices(
        &mut self,
        account_id: &str,
        max_age: Option<chrono::Duration>,
    ) -> Result<HashMap<String, f64>> {
        let key = Self::key(account_id);
        let raw: HashMap<String, String> = self.conn.hgetall(&key).await?;

        let cutoff = max_age.map(|age| Utc::now() - age);
        let mut prices = HashMap::new();

        for (ticker, json_str) in raw {
            let stored: StoredPrice = match serde_json::from_str(&json_str) {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!("Skipping unreadable cached price for {}: {}", ticker, e);
                    continue;
                }
            };

            if cutoff.map_or(false, |cutoff| stored.timestamp < cutoff) {
                continue;
            }
            if stored.price.is_finite() && stored.price > 0.0 {
                prices.insert(ticker, stored.price);
            }
        }

        tracing::info!("Loaded {} cached prices for {} from Redis", prices.len(), account_id);

        Ok(prices)
    }

    /// Drop all cached prices of the account
    pub async fn clear(&mut self, account_id: &str) -> Result<()> {
        self.conn.del::<_, ()>(Self::key(account_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(t, p)| (t.to_string(), *p)).collect()
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = RedisPriceCache::new("redis://192.0.2.1:6379").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_and_load_prices() {
        let mut cache = RedisPriceCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        cache.clear("TEST_SAVE").await.unwrap();

        cache
            .save_prices("TEST_SAVE", &prices(&[("AAPL", 190.5), ("MSFT", 410.0)]))
            .await
            .unwrap();
        cache
            .save_prices("TEST_SAVE", &prices(&[("AAPL", 191.0)]))
            .await
            .unwrap();

        let loaded = cache.load_prices("TEST_SAVE", None).await.unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["AAPL"], 191.0);
        assert_eq!(loaded["MSFT"], 410.0);

        cache.clear("TEST_SAVE").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_load_skips_stale_prices() {
        let mut cache = RedisPriceCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        cache.clear("TEST_STALE").await.unwrap();

        cache
            .save_prices("TEST_STALE", &prices(&[("AAPL", 190.5)]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let fresh = cache
            .load_prices("TEST_STALE", Some(chrono::Duration::hours(1)))
            .await
            .unwrap();
        let none = cache
            .load_prices("TEST_STALE", Some(chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(fresh.len(), 1);
        assert!(none.is_empty());

        cache.clear("TEST_STALE").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_empty_account() {
        let mut cache = RedisPriceCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let loaded = cache.load_prices("NONEXISTENT_ACCOUNT", None).await.unwrap();
        assert!(loaded.is_empty());
    }
}
