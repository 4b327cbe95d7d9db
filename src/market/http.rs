use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::MarketData;

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

/// Quote service over HTTP: `GET {base_url}/price/{ticker}` -> `{"price": f64}`
#[derive(Clone)]
pub struct HttpMarketData {
    base_url: String,
    client: Client,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl MarketData for HttpMarketData {
    async fn current_price(&self, ticker: &str) -> Result<f64> {
        let url = format!("{}/price/{}", self.base_url, ticker);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Price service rejected {}", ticker))?;

        let body: PriceResponse = response
            .json()
            .await
            .with_context(|| format!("Invalid price payload for {}", ticker))?;

        Ok(body.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_price() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/price/AAPL")
            .with_status(200)
            .with_body(r#"{"price": 187.25}"#)
            .create_async()
            .await;

        let feed = HttpMarketData::new(server.url()).unwrap();

        assert_eq!(feed.current_price("AAPL").await.unwrap(), 187.25);
    }

    #[tokio::test]
    async fn test_current_price_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/price/NOPE")
            .with_status(404)
            .create_async()
            .await;

        let feed = HttpMarketData::new(server.url()).unwrap();

        assert!(feed.current_price("NOPE").await.is_err());
    }
}
