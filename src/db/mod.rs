//! SQLite persistence layer.
//!
//! One connection behind a mutex, WAL mode for concurrent readers. Each
//! store owns a handle to the shared connection; readers get detached
//! copies, never live references into the database.

pub mod currency;
pub mod payments;
pub mod posts;
pub mod products;
pub mod settings;

pub use currency::RateStore;
pub use payments::InvoiceStore;
pub use posts::PostStore;
pub use products::ProductStore;
pub use settings::SettingsStore;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broadcast_message_id INTEGER,
    mirror_post_id TEXT,
    products_json TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    published_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_posts_status ON posts(status);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    price_native REAL NOT NULL,
    image_url TEXT NOT NULL,
    rating REAL NOT NULL,
    discount INTEGER NOT NULL,
    sales_count INTEGER NOT NULL,
    category TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_products_category_updated
    ON products(category, updated_at DESC);

CREATE TABLE IF NOT EXISTS currency_rates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_currency TEXT NOT NULL,
    to_currency TEXT NOT NULL,
    rate REAL NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_currency_rates_pair_date
    ON currency_rates(from_currency, to_currency, fetched_at DESC);

CREATE TABLE IF NOT EXISTS payments (
    payment_id TEXT PRIMARY KEY,
    client_ref TEXT NOT NULL,
    user_channel_id INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    qr_payload TEXT,
    message_id INTEGER,
    paid_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payments_client_ref ON payments(client_ref);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'string'
);
"#;

/// Shared database handle; cheap to clone. The category cache lives here so
/// every `ProductStore` handle sees the same cached rows.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    product_cache: products::CategoryCache,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening database at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;

        info!("database ready at {}", path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            product_cache: products::new_category_cache(),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            product_cache: products::new_category_cache(),
        })
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    pub fn posts(&self) -> PostStore {
        PostStore::new(self.conn.clone())
    }

    pub fn products(&self) -> ProductStore {
        ProductStore::new(self.conn.clone(), self.product_cache.clone())
    }

    pub fn rates(&self) -> RateStore {
        RateStore::new(self.conn.clone())
    }

    pub fn invoices(&self) -> InvoiceStore {
        InvoiceStore::new(self.conn.clone())
    }

    pub fn settings(&self) -> SettingsStore {
        SettingsStore::new(self.conn.clone())
    }
}
