//! Exchange-rate lookup with layered fallback.
//!
//! Order: in-memory TTL cache, external API, latest persisted row. A
//! successful external fetch writes through to both fallback layers.

use crate::cache::TtlCache;
use crate::db::RateStore;
use crate::errors::ApiError;
use crate::http::send_with_retry;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const RATE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const RATE_CACHE_CAPACITY: usize = 10;
const DEFAULT_API_BASE: &str = "https://api.exchangerate-api.com";
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a rate came from; the orchestrator records DB fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOrigin {
    Cache,
    Api,
    DbFallback,
}

#[derive(Debug, Clone, Copy)]
pub struct RateQuote {
    pub rate: f64,
    pub origin: RateOrigin,
}

#[async_trait]
pub trait RateFeed: Send + Sync {
    async fn rate(&self, from_currency: &str, to_currency: &str) -> Result<RateQuote, ApiError>;
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    rates: HashMap<String, f64>,
}

pub struct CurrencyFeed {
    client: reqwest::Client,
    base_url: String,
    cache: TtlCache<String, f64>,
    store: RateStore,
}

impl CurrencyFeed {
    pub fn new(client: reqwest::Client, store: RateStore) -> Self {
        Self::with_base_url(client, store, DEFAULT_API_BASE.to_string())
    }

    pub fn with_base_url(client: reqwest::Client, store: RateStore, base_url: String) -> Self {
        Self {
            client,
            base_url,
            cache: TtlCache::new(RATE_CACHE_TTL, RATE_CACHE_CAPACITY),
            store,
        }
    }

    fn cache_key(from_currency: &str, to_currency: &str) -> String {
        format!("{}:{}", from_currency.to_uppercase(), to_currency.to_uppercase())
    }

    async fn fetch_from_api(&self, from_currency: &str, to_currency: &str) -> Result<f64, ApiError> {
        let url = format!("{}/v4/latest/{}", self.base_url, from_currency);
        let response = send_with_retry(
            || self.client.get(&url).timeout(READ_TIMEOUT),
            "currency api",
        )
        .await?;

        let body: LatestResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("currency response: {e}")))?;

        body.rates
            .get(to_currency)
            .copied()
            .ok_or_else(|| ApiError::Schema(format!("currency {to_currency} absent from rates")))
    }
}

#[async_trait]
impl RateFeed for CurrencyFeed {
    async fn rate(&self, from_currency: &str, to_currency: &str) -> Result<RateQuote, ApiError> {
        let from = from_currency.to_uppercase();
        let to = to_currency.to_uppercase();
        let key = Self::cache_key(&from, &to);

        if let Some(rate) = self.cache.get(&key) {
            debug!("rate {}/{} from cache: {}", from, to, rate);
            return Ok(RateQuote {
                rate,
                origin: RateOrigin::Cache,
            });
        }

        match self.fetch_from_api(&from, &to).await {
            Ok(rate) => {
                self.cache.insert(key, rate);
                if let Err(e) = self.store.save(&from, &to, rate) {
                    warn!("persisting rate {}/{} failed: {}", from, to, e);
                }
                info!("rate {}/{} from api: {}", from, to, rate);
                Ok(RateQuote {
                    rate,
                    origin: RateOrigin::Api,
                })
            }
            Err(api_error) => {
                warn!("currency api failed ({}), trying stored rates", api_error);

                match self.store.latest(&from, &to) {
                    Ok(Some(rate)) => {
                        self.cache.insert(key, rate);
                        info!("rate {}/{} from stored fallback: {}", from, to, rate);
                        Ok(RateQuote {
                            rate,
                            origin: RateOrigin::DbFallback,
                        })
                    }
                    Ok(None) => Err(ApiError::BusinessRule(format!(
                        "no exchange rate available for {from}/{to}"
                    ))),
                    Err(db_error) => Err(ApiError::BusinessRule(format!(
                        "no exchange rate available for {from}/{to}: api {api_error}, db {db_error}"
                    ))),
                }
            }
        }
    }
}
