//! Exchange-rate history. Append-only; the latest row per pair is the
//! currency feed's last-resort fallback.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::info;

pub struct RateStore {
    conn: Arc<Mutex<Connection>>,
}

impl RateStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn save(&self, from_currency: &str, to_currency: &str, rate: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO currency_rates (from_currency, to_currency, rate, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                from_currency.to_uppercase(),
                to_currency.to_uppercase(),
                rate,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("inserting currency rate")?;

        info!("saved rate {}/{} = {}", from_currency, to_currency, rate);
        Ok(())
    }

    /// Latest recorded rate for the pair, if any.
    pub fn latest(&self, from_currency: &str, to_currency: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let rate = conn
            .query_row(
                "SELECT rate FROM currency_rates
                 WHERE from_currency = ?1 AND to_currency = ?2
                 ORDER BY fetched_at DESC, id DESC LIMIT 1",
                params![from_currency.to_uppercase(), to_currency.to_uppercase()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn latest_returns_most_recent_row() {
        let db = Database::open_in_memory().unwrap();
        let rates = db.rates();

        assert_eq!(rates.latest("CNY", "KGS").unwrap(), None);

        rates.save("CNY", "KGS", 11.8).unwrap();
        rates.save("CNY", "KGS", 12.1).unwrap();
        rates.save("USD", "KGS", 89.5).unwrap();

        assert_eq!(rates.latest("CNY", "KGS").unwrap(), Some(12.1));
        assert_eq!(rates.latest("USD", "KGS").unwrap(), Some(89.5));
    }

    #[test]
    fn pairs_are_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        let rates = db.rates();
        rates.save("cny", "kgs", 11.8).unwrap();
        assert_eq!(rates.latest("CNY", "KGS").unwrap(), Some(11.8));
    }
}
