use crate::config::chains::ChainConfig;
use crate::utils::rpc::bounded_exponential_backoff_ms;
use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const COINS_API_BASE_URL: &str = "https://coins.llama.fi";
const MAX_RETRIES: u32 = 3;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// USD price of an ERC-20 token.
#[async_trait]
pub trait TokenPriceFeed: Send + Sync {
    async fn token_price_usd(&self, token: Address, chain_id: u64) -> Result<f64>;
}

// https://coins.llama.fi/prices/current/base:0xabc...
#[derive(Deserialize)]
struct CoinsResponse {
    coins: HashMap<String, CoinPrice>,
}

#[derive(Deserialize)]
struct CoinPrice {
    price: f64,
}

pub struct DefiLlamaPriceFeed {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: DashMap<(u64, Address), (f64, Instant)>,
}

impl DefiLlamaPriceFeed {
    pub fn new() -> Self {
        Self::with_base_url(COINS_API_BASE_URL, Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
    }

    pub fn with_base_url(base_url: &str, ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            cache: DashMap::new(),
        }
    }

    fn coin_key(token: Address, chain_id: u64) -> String {
        format!("{}:{:#x}", ChainConfig::get(chain_id).price_slug, token)
    }

    fn cached(&self, token: Address, chain_id: u64) -> Option<f64> {
        let entry = self.cache.get(&(chain_id, token))?;
        let (price, fetched_at) = *entry.value();
        (fetched_at.elapsed() < self.ttl).then_some(price)
    }

    async fn fetch_price(&self, key: &str) -> Result<f64> {
        let url = format!("{}/prices/current/{}", self.base_url, key);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(bounded_exponential_backoff_ms(500, attempt - 1, 4_000));
                tokio::time::sleep(backoff).await;
            }

            match self
                .client
                .get(&url)
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        last_err = Some(anyhow::anyhow!("HTTP {}", status));
                        continue;
                    }
                    match resp.json::<CoinsResponse>().await {
                        Ok(body) => return price_from_response(&body, key),
                        Err(e) => {
                            last_err = Some(e.into());
                            continue;
                        }
                    }
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("fetch_price: no attempts made")))
    }
}

impl Default for DefiLlamaPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn price_from_response(body: &CoinsResponse, key: &str) -> Result<f64> {
    body.coins
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, coin)| coin.price)
        .filter(|price| price.is_finite() && *price >= 0.0)
        .ok_or_else(|| anyhow::anyhow!("no price for {key}"))
}

#[async_trait]
impl TokenPriceFeed for DefiLlamaPriceFeed {
    async fn token_price_usd(&self, token: Address, chain_id: u64) -> Result<f64> {
        if let Some(price) = self.cached(token, chain_id) {
            return Ok(price);
        }
        let key = Self::coin_key(token, chain_id);
        let price = self.fetch_price(&key).await?;
        self.cache.insert((chain_id, token), (price, Instant::now()));
        Ok(price)
    }
}
