//! Primary marketplace client (Pinduoduo via RapidAPI).
//!
//! Responses come back with prices in fen, sales figures as Chinese display
//! strings and thumbnail-sized image URLs; everything is normalised here and
//! malformed items are skipped rather than failing the batch.

use crate::errors::ApiError;
use crate::http::send_with_retry;
use crate::marketplaces::{DailyQuota, Marketplace};
use crate::models::{RawProduct, Source};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{info, warn};

const RAPIDAPI_BASE_URL: &str = "https://pinduoduo1.p.rapidapi.com";
const RAPIDAPI_HOST: &str = "pinduoduo1.p.rapidapi.com";
pub const DAILY_RATE_LIMIT: u32 = 100;

/// Rating placeholder: the upstream search payload carries no ratings.
const DEFAULT_RATING: f64 = 4.5;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    success: Option<bool>,
    message: Option<String>,
    data: Option<SearchData>,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    items: Option<Vec<Value>>,
}

pub struct PinduoduoClient {
    client: reqwest::Client,
    api_key: String,
    quota: DailyQuota,
}

impl PinduoduoClient {
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

/// Parse sales figures like `已抢6475件` or `总售24万+件`.
/// `万` multiplies by ten thousand.
pub fn parse_sales_count(sales: &str) -> i64 {
    let cleaned = sales
        .replace('件', "")
        .replace("已抢", "")
        .replace("总售", "")
        .replace('+', "");
    let cleaned = cleaned.trim();

    if let Some(stripped) = cleaned.strip_suffix('万') {
        return stripped
            .trim()
            .parse::<f64>()
            .map(|n| (n * 10_000.0) as i64)
            .unwrap_or(0);
    }

    cleaned.parse::<f64>().map(|n| n as i64).unwrap_or(0)
}

fn regexes() -> &'static [(Regex, &'static str)] {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        vec![
            // size suffixes like _200x200 before the extension
            (Regex::new(r"_\d+x\d+(\.\w+$|\?)").unwrap(), "$1"),
            // query params that cap dimensions
            (Regex::new(r"[@?&]w=\d+").unwrap(), ""),
            (Regex::new(r"[@?&]h=\d+").unwrap(), ""),
            // quality suffixes
            (Regex::new(r"_q\d+(\.\w+$|\?)").unwrap(), "$1"),
        ]
    })
}

/// Rewrite a thumbnail URL to its highest-resolution variant (x800 is the
/// largest size the CDN serves).
pub fn upgrade_image_url(url: &str) -> String {
    if url.is_empty() {
        return url.to_string();
    }

    static MOGR: OnceLock<Regex> = OnceLock::new();
    let mogr = MOGR.get_or_init(|| Regex::new(r"imageMogr2/thumbnail/x\d+").unwrap());

    if url.contains("imageMogr2/thumbnail/") {
        return mogr.replace_all(url, "imageMogr2/thumbnail/x800").into_owned();
    }

    if url.contains("pddpic.com") && !url.contains('?') {
        return format!("{url}?imageMogr2/thumbnail/x800");
    }

    let mut out = url.to_string();
    for (re, replacement) in regexes() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out = out.replace(".jpg.jpg", ".jpg").replace(".png.png", ".png");
    out
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse one search item; `None` drops it from the batch.
fn parse_product(item: &Value) -> Option<RawProduct> {
    let id = item.get("goods_id").and_then(value_as_string)?;
    let title = item
        .get("goods_name")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())?
        .to_string();

    // Prices arrive in fen (1/100 yuan)
    let default_price = item.get("default_price").and_then(value_as_f64);
    let market_price = item.get("market_price").and_then(value_as_f64);
    let price_fen = default_price.or(market_price).unwrap_or(0.0);
    let price_native = price_fen / 100.0;
    if price_native <= 0.0 {
        return None;
    }

    let mut image_url = item
        .get("hd_thumb_url")
        .and_then(Value::as_str)
        .or_else(|| item.get("thumb_url").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    if image_url.starts_with("//") {
        image_url = format!("https:{image_url}");
    }
    if image_url.is_empty() {
        return None;
    }
    let image_url = upgrade_image_url(&image_url);

    let sales_count = item
        .get("side_sales_tip")
        .and_then(Value::as_str)
        .map(parse_sales_count)
        .unwrap_or(0);

    let discount_pct = match (market_price, default_price) {
        (Some(market), Some(default)) if market > default && market > 0.0 => {
            ((1.0 - default / market) * 100.0) as i32
        }
        _ => 0,
    };

    Some(RawProduct {
        id,
        title,
        price_native,
        image_url,
        rating: DEFAULT_RATING,
        discount_pct,
        sales_count,
        source: Source::Pinduoduo,
    })
}

#[async_trait]
impl Marketplace for PinduoduoClient {
    fn source(&self) -> Source {
        Source::Pinduoduo
    }

    async fn fetch(&self, search_term: &str, page_size: usize) -> Result<Vec<RawProduct>, ApiError> {
        self.quota.check()?;

        let url = format!("{RAPIDAPI_BASE_URL}/pinduoduo/search");
        let response = send_with_retry(
            || {
                self.client
                    .get(&url)
                    .header("X-RapidAPI-Key", &self.api_key)
                    .header("X-RapidAPI-Host", RAPIDAPI_HOST)
                    .query(&[("keyword", search_term), ("page", "1")])
            },
            "pinduoduo search",
        )
        .await?;

        self.quota.record();

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("pinduoduo response: {e}")))?;

        if body.success == Some(false) {
            let message = body.message.unwrap_or_else(|| "unknown error".to_string());
            return Err(ApiError::Permanent {
                status: 200,
                body: format!("pinduoduo api error: {message}"),
            });
        }

        let items = body.data.and_then(|d| d.items).unwrap_or_default();
        let mut products = Vec::new();
        for item in items.iter().take(page_size) {
            match parse_product(item) {
                Some(product) => products.push(product),
                None => warn!(
                    "skipping malformed pinduoduo item (goods_id={:?})",
                    item.get("goods_id")
                ),
            }
        }

        info!(
            "pinduoduo search '{}': {} products ({} requests left today)",
            search_term,
            products.len(),
            self.quota.remaining()
        );

        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sales_strings_parse_with_cjk_suffixes() {
        assert_eq!(parse_sales_count("已抢6475件"), 6475);
        assert_eq!(parse_sales_count("总售24万+件"), 240_000);
        assert_eq!(parse_sales_count("1.5万件"), 15_000);
        assert_eq!(parse_sales_count("320"), 320);
        assert_eq!(parse_sales_count(""), 0);
        assert_eq!(parse_sales_count("热卖中"), 0);
    }

    #[test]
    fn thumbnail_urls_upgrade_to_x800() {
        assert_eq!(
            upgrade_image_url("https://img.pddpic.com/a.jpg?imageMogr2/thumbnail/x200"),
            "https://img.pddpic.com/a.jpg?imageMogr2/thumbnail/x800"
        );
        assert_eq!(
            upgrade_image_url("https://img.pddpic.com/a.jpg"),
            "https://img.pddpic.com/a.jpg?imageMogr2/thumbnail/x800"
        );
        assert_eq!(
            upgrade_image_url("https://cdn.example.com/pic_200x200.jpg"),
            "https://cdn.example.com/pic.jpg"
        );
    }

    #[test]
    fn items_parse_with_fen_prices_and_derived_discount() {
        let item = json!({
            "goods_id": 123456,
            "goods_name": "蓝牙耳机",
            "default_price": 1990,
            "market_price": 3980,
            "hd_thumb_url": "//img.pddpic.com/p.jpg",
            "side_sales_tip": "已抢6475件"
        });

        let product = parse_product(&item).unwrap();
        assert_eq!(product.id, "123456");
        assert!((product.price_native - 19.9).abs() < 1e-9);
        assert_eq!(product.discount_pct, 50);
        assert_eq!(product.sales_count, 6475);
        assert!(product.image_url.starts_with("https://"));
        assert_eq!(product.source, Source::Pinduoduo);
    }

    #[test]
    fn items_without_id_price_or_image_are_skipped() {
        assert!(parse_product(&json!({"goods_name": "x"})).is_none());
        assert!(parse_product(&json!({
            "goods_id": "1", "goods_name": "x", "default_price": 0,
            "hd_thumb_url": "https://img/p.jpg"
        }))
        .is_none());
        assert!(parse_product(&json!({
            "goods_id": "1", "goods_name": "x", "default_price": 100
        }))
        .is_none());
    }
}
