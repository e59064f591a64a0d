//! Secondary marketplace client (Taobao via the Otapi RapidAPI frame).

use crate::errors::ApiError;
use crate::http::send_with_retry;
use crate::marketplaces::{DailyQuota, Marketplace};
use crate::models::{RawProduct, Source};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

const RAPIDAPI_BASE_URL: &str = "https://taobao-tmall1.p.rapidapi.com";
const RAPIDAPI_HOST: &str = "taobao-tmall1.p.rapidapi.com";
pub const DAILY_RATE_LIMIT: u32 = 100;

/// VendorScore comes back on a 0-20 scale.
const VENDOR_SCORE_DIVISOR: f64 = 4.0;

#[derive(Debug, Deserialize)]
struct FrameResponse {
    #[serde(rename = "ErrorCode")]
    error_code: Option<String>,
    #[serde(rename = "ErrorDescription")]
    error_description: Option<String>,
    #[serde(rename = "Result")]
    result: Option<FrameResult>,
}

#[derive(Debug, Deserialize)]
struct FrameResult {
    #[serde(rename = "Items")]
    items: Option<FrameItems>,
}

#[derive(Debug, Deserialize)]
struct FrameItems {
    #[serde(rename = "Items")]
    items: Option<FrameContent>,
}

#[derive(Debug, Deserialize)]
struct FrameContent {
    #[serde(rename = "Content")]
    content: Option<Vec<Value>>,
}

pub struct TaobaoClient {
    client: reqwest::Client,
    api_key: String,
    quota: DailyQuota,
}

impl TaobaoClient {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            quota: DailyQuota::new(DAILY_RATE_LIMIT),
        }
    }

    pub fn requests_remaining(&self) -> u32 {
        self.quota.remaining()
    }
}

fn price_field(price: &Value, key: &str) -> Option<f64> {
    match price.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Parse one frame item; `None` drops it from the batch.
fn parse_product(item: &Value) -> Option<RawProduct> {
    let id = match item.get("Id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return None,
    };

    let title = item
        .get("Title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .or_else(|| item.get("OriginalTitle").and_then(Value::as_str))
        .filter(|t| !t.is_empty())?
        .to_string();

    // Price is a nested object; a bare number is tolerated.
    let price = item.get("Price")?;
    let (price_native, margin_price) = if price.is_object() {
        (
            price_field(price, "OriginalPrice").unwrap_or(0.0),
            price_field(price, "MarginPrice"),
        )
    } else {
        (price.as_f64().unwrap_or(0.0), None)
    };
    if price_native <= 0.0 {
        return None;
    }

    let mut image_url = item
        .get("MainPictureUrl")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if image_url.is_empty() {
        if let Some(pictures) = item.get("Pictures").and_then(Value::as_array) {
            image_url = pictures
                .first()
                .and_then(|p| p.get("Url").and_then(Value::as_str).or(p.as_str()))
                .unwrap_or_default()
                .to_string();
        }
    }
    if image_url.starts_with("//") {
        image_url = format!("https:{image_url}");
    }
    if image_url.is_empty() {
        return None;
    }

    let vendor_score = item
        .get("VendorScore")
        .and_then(Value::as_f64)
        .unwrap_or(15.0);
    let rating = (vendor_score / VENDOR_SCORE_DIVISOR).clamp(0.0, 5.0);

    let sales_count = item.get("Volume").and_then(Value::as_i64).unwrap_or(0);

    let discount_pct = match margin_price {
        Some(margin) if margin > price_native && margin > 0.0 => {
            ((1.0 - price_native / margin) * 100.0) as i32
        }
        _ => 0,
    };

    Some(RawProduct {
        id,
        title,
        price_native,
        image_url,
        rating,
        discount_pct,
        sales_count,
        source: Source::Taobao,
    })
}

#[async_trait]
impl Marketplace for TaobaoClient {
    fn source(&self) -> Source {
        Source::Taobao
    }

    async fn fetch(&self, search_term: &str, page_size: usize) -> Result<Vec<RawProduct>, ApiError> {
        self.quota.check()?;

        let url = format!("{RAPIDAPI_BASE_URL}/BatchSearchItemsFrame");
        let size = page_size.to_string();
        let response = send_with_retry(
            || {
                self.client
                    .get(&url)
                    .header("X-RapidAPI-Key", &self.api_key)
                    .header("X-RapidAPI-Host", RAPIDAPI_HOST)
                    .query(&[
                        ("frame", "Taobao"),
                        ("framePosition", "1"),
                        ("frameSize", size.as_str()),
                        ("language", "en"),
                        ("ItemTitle", search_term),
                    ])
            },
            "taobao search",
        )
        .await?;

        self.quota.record();

        let body: FrameResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("taobao response: {e}")))?;

        if let Some(code) = &body.error_code {
            if code != "Ok" {
                let description = body
                    .error_description
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(ApiError::Permanent {
                    status: 200,
                    body: format!("taobao api error {code}: {description}"),
                });
            }
        }

        let items = body
            .result
            .and_then(|r| r.items)
            .and_then(|i| i.items)
            .and_then(|c| c.content)
            .unwrap_or_default();

        let mut products = Vec::new();
        for item in &items {
            match parse_product(item) {
                Some(product) => products.push(product),
                None => warn!("skipping malformed taobao item (Id={:?})", item.get("Id")),
            }
        }

        info!(
            "taobao search '{}': {} products ({} requests left today)",
            search_term,
            products.len(),
            self.quota.remaining()
        );

        Ok(products)
    }
}
