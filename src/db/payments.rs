//! Invoice records. The PENDING → PAID transition is a single guarded
//! UPDATE so concurrent webhook deliveries and admin commands serialise on
//! the storage layer.

use crate::payments::{Invoice, InvoiceStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;

pub struct InvoiceStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_invoice(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let status_str: String = row.get("status")?;
    let paid_at: Option<String> = row.get("paid_at")?;
    let created_at: String = row.get("created_at")?;

    Ok(Invoice {
        payment_id: row.get("payment_id")?,
        client_ref: row.get("client_ref")?,
        user_channel_id: row.get("user_channel_id")?,
        amount: row.get("amount")?,
        description: row.get("description")?,
        status: InvoiceStatus::parse(&status_str).unwrap_or(InvoiceStatus::Pending),
        qr_payload: row.get("qr_payload")?,
        message_id: row.get("message_id")?,
        paid_at: paid_at.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
    })
}

impl InvoiceStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn create(
        &self,
        payment_id: &str,
        client_ref: &str,
        user_channel_id: i64,
        amount: i64,
        description: &str,
        qr_payload: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO payments
                (payment_id, client_ref, user_channel_id, amount, description,
                 status, qr_payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                payment_id,
                client_ref,
                user_channel_id,
                amount,
                description,
                InvoiceStatus::Pending.as_str(),
                qr_payload,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("inserting invoice")?;

        info!("invoice {} created for {} ({} tiyin)", payment_id, client_ref, amount);
        Ok(())
    }

    pub fn get(&self, payment_id: &str) -> Result<Option<Invoice>> {
        let conn = self.conn.lock();
        let invoice = conn
            .query_row(
                "SELECT * FROM payments WHERE payment_id = ?1",
                params![payment_id],
                row_to_invoice,
            )
            .optional()?;
        Ok(invoice)
    }

    /// Record which chat message carries the QR code, so finalisation can
    /// delete it later.
    pub fn set_message_id(&self, payment_id: &str, message_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE payments SET message_id = ?1 WHERE payment_id = ?2",
            params![message_id, payment_id],
        )?;
        Ok(())
    }

    /// Atomic check-and-set to PAID. Returns `true` only for the invocation
    /// that actually performed the transition; a row already PAID leaves the
    /// database untouched and returns `false`.
    pub fn mark_paid(&self, payment_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE payments SET status = ?1, paid_at = ?2
             WHERE payment_id = ?3 AND status != ?1",
            params![
                InvoiceStatus::Paid.as_str(),
                Utc::now().to_rfc3339(),
                payment_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Non-terminal status updates (cancelled, expired, processing, ...).
    /// A PAID row never moves again.
    pub fn set_status(&self, payment_id: &str, status: InvoiceStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE payments SET status = ?1 WHERE payment_id = ?2 AND status != ?3",
            params![status.as_str(), payment_id, InvoiceStatus::Paid.as_str()],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn seed(db: &Database) -> InvoiceStore {
        let store = db.invoices();
        store
            .create("inv-1", "KV-5002", 77001, 5000, "Доставка посылки", Some("qr-data"))
            .unwrap();
        store
    }

    #[test]
    fn create_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let store = seed(&db);

        let invoice = store.get("inv-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.amount, 5000);
        assert_eq!(invoice.qr_payload.as_deref(), Some("qr-data"));
        assert!(invoice.paid_at.is_none());

        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn mark_paid_is_monotonic_and_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let store = seed(&db);

        assert!(store.mark_paid("inv-1").unwrap());
        let first = store.get("inv-1").unwrap().unwrap();
        assert_eq!(first.status, InvoiceStatus::Paid);
        let paid_at = first.paid_at.unwrap();

        // Second transition is a no-op
        assert!(!store.mark_paid("inv-1").unwrap());
        let second = store.get("inv-1").unwrap().unwrap();
        assert_eq!(second.paid_at.unwrap(), paid_at);

        // A paid row cannot move to any other status
        assert!(!store.set_status("inv-1", InvoiceStatus::Cancelled).unwrap());
        assert_eq!(store.get("inv-1").unwrap().unwrap().status, InvoiceStatus::Paid);
    }

    #[test]
    fn duplicate_payment_ids_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let store = seed(&db);
        assert!(store
            .create("inv-1", "KV-5002", 77001, 100, "dup", None)
            .is_err());
    }

    #[test]
    fn message_id_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        let store = seed(&db);
        store.set_message_id("inv-1", 991).unwrap();
        assert_eq!(store.get("inv-1").unwrap().unwrap().message_id, Some(991));
    }
}
