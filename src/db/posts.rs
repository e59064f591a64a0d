//! Post records: publication history of the daily pipeline.

use crate::models::{PostRecord, PostStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

pub struct PostStore {
    conn: Arc<Mutex<Connection>>,
}

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<PostRecord> {
    let status_str: String = row.get("status")?;
    let products_raw: String = row.get("products_json")?;
    let created_at: String = row.get("created_at")?;
    let published_at: Option<String> = row.get("published_at")?;

    Ok(PostRecord {
        id: row.get("id")?,
        broadcast_message_id: row.get("broadcast_message_id")?,
        mirror_post_id: row.get("mirror_post_id")?,
        products_json: serde_json::from_str(&products_raw).unwrap_or(serde_json::Value::Null),
        status: PostStatus::parse(&status_str).unwrap_or(PostStatus::Pending),
        created_at: parse_ts(&created_at),
        published_at: published_at.as_deref().map(parse_ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl PostStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert the run's post row. `published_at` is stamped for any status
    /// that reflects a completed broadcast.
    pub fn create(
        &self,
        products_json: &serde_json::Value,
        broadcast_message_id: Option<i64>,
        mirror_post_id: Option<&str>,
        status: PostStatus,
    ) -> Result<i64> {
        let now = Utc::now();
        let published_at = match status {
            PostStatus::Pending => None,
            _ => Some(now.to_rfc3339()),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO posts (broadcast_message_id, mirror_post_id, products_json, status, created_at, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                broadcast_message_id,
                mirror_post_id,
                products_json.to_string(),
                status.as_str(),
                now.to_rfc3339(),
                published_at,
            ],
        )
        .context("inserting post")?;

        let id = conn.last_insert_rowid();
        info!("post {} recorded with status {}", id, status.as_str());
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<Option<PostRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM posts WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], row_to_post)?;
        Ok(rows.next().transpose()?)
    }

    /// The single forward transition allowed on a finished row: a late
    /// mirror success upgrades MirrorFailed to Published.
    pub fn record_mirror_post(&self, id: i64, mirror_post_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET mirror_post_id = ?1, status = ?2, published_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                mirror_post_id,
                PostStatus::Published.as_str(),
                Utc::now().to_rfc3339(),
                id,
                PostStatus::MirrorFailed.as_str(),
            ],
        )?;

        if changed == 0 {
            warn!("post {} not eligible for late mirror update", id);
        }
        Ok(changed > 0)
    }

    /// Newest-first page of posts, optionally filtered by status.
    /// Returns the page and the total row count.
    pub fn list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<PostStatus>,
    ) -> Result<(Vec<PostRecord>, usize)> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) * page_size;

        let conn = self.conn.lock();
        let (total, records) = match status {
            Some(status) => {
                let total: usize = conn.query_row(
                    "SELECT COUNT(*) FROM posts WHERE status = ?1",
                    params![status.as_str()],
                    |r| r.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT * FROM posts WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(params![status.as_str(), page_size, offset], row_to_post)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (total, rows)
            }
            None => {
                let total: usize =
                    conn.query_row("SELECT COUNT(*) FROM posts", [], |r| r.get(0))?;
                let mut stmt = conn.prepare(
                    "SELECT * FROM posts ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![page_size, offset], row_to_post)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (total, rows)
            }
        };

        Ok((records, total))
    }
}
