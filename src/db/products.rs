//! Cached marketplace products, the Stage 1 fallback source.
//!
//! Successful fetches are upserted here; when a marketplace branch is down
//! the pipeline reads the latest rows per category instead. A 24-hour TTL
//! cache sits in front of the table and is invalidated on writes.

use crate::cache::TtlCache;
use crate::models::{RawProduct, Source};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Category cardinality is bounded by the rotation table.
pub const CACHE_CAPACITY: usize = 16;
pub const OLD_PRODUCT_DAYS: i64 = 7;
const FETCH_LIMIT: usize = 100;

pub type CategoryCache = Arc<TtlCache<String, Vec<RawProduct>>>;

pub fn new_category_cache() -> CategoryCache {
    Arc::new(TtlCache::new(CACHE_TTL, CACHE_CAPACITY))
}

pub struct ProductStore {
    conn: Arc<Mutex<Connection>>,
    cache: CategoryCache,
}

fn storage_id(product: &RawProduct) -> String {
    format!("{}:{}", product.source.as_str(), product.id)
}

impl ProductStore {
    pub fn new(conn: Arc<Mutex<Connection>>, cache: CategoryCache) -> Self {
        Self { conn, cache }
    }

    /// Upsert a fetched batch under a category. Existing rows (same source
    /// id) get fresh fields and `updated_at`; `created_at` is preserved.
    pub fn upsert(&self, products: &[RawProduct], category: &str) -> Result<usize> {
        if products.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().context("starting upsert transaction")?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO products
                        (source_id, title, price_native, image_url, rating, discount,
                         sales_count, category, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                     ON CONFLICT(source_id) DO UPDATE SET
                        title = excluded.title,
                        price_native = excluded.price_native,
                        image_url = excluded.image_url,
                        rating = excluded.rating,
                        discount = excluded.discount,
                        sales_count = excluded.sales_count,
                        category = excluded.category,
                        source = excluded.source,
                        updated_at = excluded.updated_at",
                )?;
                for product in products {
                    stmt.execute(params![
                        storage_id(product),
                        product.title,
                        product.price_native,
                        product.image_url,
                        product.rating,
                        product.discount_pct,
                        product.sales_count,
                        category,
                        product.source.as_str(),
                        now,
                    ])?;
                }
            }
            tx.commit().context("committing upsert")?;
        }

        self.cache.evict(&category.to_string());
        debug!("upserted {} products into category {}", products.len(), category);
        Ok(products.len())
    }

    /// Latest products for a category, newest update first. Served from the
    /// TTL cache when warm.
    pub fn cached_for_category(&self, category: &str, limit: usize) -> Result<Vec<RawProduct>> {
        let key = category.to_string();
        if let Some(cached) = self.cache.get(&key) {
            debug!("category {} served from cache ({} rows)", category, cached.len());
            return Ok(cached.into_iter().take(limit).collect());
        }

        let products = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT source_id, title, price_native, image_url, rating, discount,
                        sales_count, source
                 FROM products WHERE category = ?1
                 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![category, FETCH_LIMIT], |row| {
                let source_id: String = row.get(0)?;
                let source_str: String = row.get(7)?;
                let source = Source::parse(&source_str).unwrap_or(Source::Pinduoduo);
                let id = source_id
                    .split_once(':')
                    .map(|(_, id)| id.to_string())
                    .unwrap_or(source_id);
                Ok(RawProduct {
                    id,
                    title: row.get(1)?,
                    price_native: row.get(2)?,
                    image_url: row.get(3)?,
                    rating: row.get(4)?,
                    discount_pct: row.get(5)?,
                    sales_count: row.get(6)?,
                    source,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        self.cache.insert(key, products.clone());
        Ok(products.into_iter().take(limit).collect())
    }

    /// Periodic maintenance: drop rows not refreshed within the window.
    pub fn delete_old(&self, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();
        let deleted = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM products WHERE updated_at < ?1", params![cutoff])?
        };

        if deleted > 0 {
            // Affected categories are unknown, drop everything
            self.cache.clear();
            info!("deleted {} stale products (older than {} days)", deleted, days);
        }
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn raw(id: &str, title: &str) -> RawProduct {
        RawProduct {
            id: id.into(),
            title: title.into(),
            price_native: 19.9,
            image_url: format!("https://img.example.com/{id}.jpg"),
            rating: 4.5,
            discount_pct: 40,
            sales_count: 500,
            source: Source::Pinduoduo,
        }
    }

    #[test]
    fn upserting_same_source_id_twice_keeps_one_row() {
        let db = Database::open_in_memory().unwrap();
        let store = db.products();

        store.upsert(&[raw("g1", "old title")], "bags").unwrap();
        store.upsert(&[raw("g1", "new title")], "bags").unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let cached = store.cached_for_category("bags", 10).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].title, "new title");
    }

    #[test]
    fn upsert_preserves_created_at() {
        let db = Database::open_in_memory().unwrap();
        let store = db.products();

        store.upsert(&[raw("g1", "a")], "bags").unwrap();
        let created: String = db
            .conn()
            .lock()
            .query_row("SELECT created_at FROM products", [], |r| r.get(0))
            .unwrap();

        store.upsert(&[raw("g1", "b")], "bags").unwrap();
        let (created_after, updated_after): (String, String) = db
            .conn()
            .lock()
            .query_row("SELECT created_at, updated_at FROM products", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();

        assert_eq!(created, created_after);
        assert!(updated_after >= created_after);
    }

    #[test]
    fn same_id_from_different_sources_are_distinct_rows() {
        let db = Database::open_in_memory().unwrap();
        let store = db.products();

        let mut taobao = raw("g1", "from taobao");
        taobao.source = Source::Taobao;

        store.upsert(&[raw("g1", "from pdd"), taobao], "bags").unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn category_fetch_respects_limit_and_cache_invalidation() {
        let db = Database::open_in_memory().unwrap();
        let store = db.products();

        let batch: Vec<RawProduct> = (0..5).map(|i| raw(&format!("g{i}"), "t")).collect();
        store.upsert(&batch, "home").unwrap();

        assert_eq!(store.cached_for_category("home", 3).unwrap().len(), 3);

        // A write invalidates the cached list
        store.upsert(&[raw("g9", "late")], "home").unwrap();
        let refreshed = store.cached_for_category("home", 10).unwrap();
        assert_eq!(refreshed.len(), 6);
    }

    #[test]
    fn delete_old_removes_nothing_for_fresh_rows() {
        let db = Database::open_in_memory().unwrap();
        let store = db.products();
        store.upsert(&[raw("g1", "t")], "bags").unwrap();
        assert_eq!(store.delete_old(OLD_PRODUCT_DAYS).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
    }
}
