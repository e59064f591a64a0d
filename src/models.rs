//! Domain value types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marketplace a product was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Pinduoduo,
    Taobao,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Pinduoduo => "pinduoduo",
            Source::Taobao => "taobao",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pinduoduo" => Some(Source::Pinduoduo),
            "taobao" => Some(Source::Taobao),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product as returned by a marketplace client. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProduct {
    pub id: String,
    pub title: String,
    /// Price in the marketplace's currency (yuan).
    pub price_native: f64,
    pub image_url: String,
    /// Rating in [0, 5].
    pub rating: f64,
    /// Marketplace-reported discount in [0, 100].
    pub discount_pct: i32,
    pub sales_count: i64,
    pub source: Source,
}

impl RawProduct {
    /// Ranking key: products with deeper discounts and more sales first.
    pub fn profitability(&self) -> i64 {
        (self.discount_pct as i64) * self.sales_count
    }
}

/// Product with localised marketing prices, derived in the price-conversion
/// stage. `old_price_local >= price_local` always; the displayed discount is
/// recomputed from the two local prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub price_native: f64,
    /// Pretty-rounded local price (som).
    pub price_local: i64,
    /// Synthetic "was" price for the strikethrough display.
    pub old_price_local: i64,
    pub image_url: String,
    pub rating: f64,
    pub discount_pct: i32,
    pub sales_count: i64,
    pub source: Source,
}

impl Product {
    pub fn savings(&self) -> i64 {
        self.old_price_local - self.price_local
    }

    pub fn profitability(&self) -> i64 {
        (self.discount_pct as i64) * self.sales_count
    }
}

/// Publication state of a post record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Created but nothing published yet.
    Pending,
    /// Broadcast succeeded; mirroring was not configured.
    BroadcastOnly,
    /// Both broadcast and mirror succeeded.
    Published,
    /// Broadcast succeeded; a mirror attempt failed.
    MirrorFailed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::BroadcastOnly => "broadcast_only",
            PostStatus::Published => "published",
            PostStatus::MirrorFailed => "mirror_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PostStatus::Pending),
            "broadcast_only" => Some(PostStatus::BroadcastOnly),
            "published" => Some(PostStatus::Published),
            "mirror_failed" => Some(PostStatus::MirrorFailed),
            _ => None,
        }
    }
}

/// Post row as persisted and served over the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct PostRecord {
    pub id: i64,
    pub broadcast_message_id: Option<i64>,
    pub mirror_post_id: Option<String>,
    pub products_json: serde_json::Value,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Entry of the `products_json` snapshot stored with each post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: String,
    pub title: String,
    pub price_native: f64,
    pub price_local: i64,
    pub old_price_local: i64,
    pub discount_pct: i32,
    pub rating: f64,
    pub source: Source,
}

impl From<&Product> for ProductSnapshot {
    fn from(p: &Product) -> Self {
        Self {
            id: p.id.clone(),
            title: p.title.clone(),
            price_native: p.price_native,
            price_local: p.price_local,
            old_price_local: p.old_price_local,
            discount_pct: p.discount_pct,
            rating: p.rating,
            source: p.source,
        }
    }
}
