//! Dynamic key/value settings with a type tag. Secrets never land here;
//! they stay in the process environment.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::info;

/// Supported value types for stored settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    String,
    Int,
    Float,
    Bool,
    Json,
}

impl SettingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingType::String => "string",
            SettingType::Int => "int",
            SettingType::Float => "float",
            SettingType::Bool => "bool",
            SettingType::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(SettingType::String),
            "int" => Some(SettingType::Int),
            "float" => Some(SettingType::Float),
            "bool" => Some(SettingType::Bool),
            "json" => Some(SettingType::Json),
            _ => None,
        }
    }
}

/// Keys that must never be persisted, whatever the caller intends.
const FORBIDDEN_KEY_PARTS: &[&str] = &["token", "password", "secret", "api_key"];

pub struct SettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SettingsStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn set(&self, key: &str, value: &str, value_type: SettingType) -> Result<()> {
        let lowered = key.to_lowercase();
        if FORBIDDEN_KEY_PARTS.iter().any(|part| lowered.contains(part)) {
            bail!("refusing to persist secret-like setting key '{key}'");
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, type) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, type = excluded.type",
            params![key, value, value_type.as_str()],
        )
        .context("writing setting")?;

        info!("setting {} updated", key);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<(String, SettingType)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT value, type FROM settings WHERE key = ?1",
                params![key],
                |row| {
                    let value: String = row.get(0)?;
                    let type_str: String = row.get(1)?;
                    Ok((value, type_str))
                },
            )
            .optional()?;

        Ok(row.map(|(value, type_str)| {
            (value, SettingType::parse(&type_str).unwrap_or(SettingType::String))
        }))
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get(key)?.and_then(|(v, _)| v.parse().ok()))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self
            .get(key)?
            .map(|(v, _)| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn set_and_get_with_type_tag() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();

        settings.set("posting_time", "19:30", SettingType::String).unwrap();
        settings.set("max_products", "8", SettingType::Int).unwrap();
        settings.set("mirror_enabled", "true", SettingType::Bool).unwrap();

        let (value, value_type) = settings.get("posting_time").unwrap().unwrap();
        assert_eq!(value, "19:30");
        assert_eq!(value_type, SettingType::String);
        assert_eq!(settings.get_int("max_products").unwrap(), Some(8));
        assert_eq!(settings.get_bool("mirror_enabled").unwrap(), Some(true));
        assert!(settings.get("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_overwrites_value() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        settings.set("k", "1", SettingType::Int).unwrap();
        settings.set("k", "2", SettingType::Int).unwrap();
        assert_eq!(settings.get_int("k").unwrap(), Some(2));
    }

    #[test]
    fn secret_like_keys_are_refused() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        assert!(settings.set("bot_token", "x", SettingType::String).is_err());
        assert!(settings.set("DENGI_PASSWORD", "x", SettingType::String).is_err());
    }
}
