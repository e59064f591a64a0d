//! Application configuration, read once at startup from the process
//! environment. Secrets live here and only here; they are never persisted.

use anyhow::{bail, Result};
use std::env;

/// Everything the process needs, resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Scheduler
    pub posting_time: String,
    pub timezone: String,

    // Marketplaces (single shared RapidAPI secret)
    pub rapidapi_key: String,

    // Text generation
    pub openrouter_api_key: String,
    pub openai_model: String,
    pub openai_timeout_secs: u64,

    // Broadcast channel
    pub telegram_bot_token: String,
    pub channel_id: String,
    pub admin_chat_ids: Vec<i64>,
    pub contact_username: String,

    // Mirror (optional; enabled when both are present)
    pub instagram_access_token: Option<String>,
    pub instagram_account_id: Option<String>,

    // Payment gateway
    pub dengi_api_url: String,
    pub dengi_sid: String,
    pub dengi_password: String,
    pub dengi_api_version: u32,
    pub dengi_test_mode: bool,
    pub dengi_strict_webhook: bool,

    // Persistence
    pub database_path: String,

    // Filtering
    pub min_discount: i32,
    pub min_rating: f64,
    pub top_limit: usize,
    pub max_products: usize,

    // HTTP surface
    pub port: u16,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let telegram_bot_token = var_or("TELEGRAM_BOT_TOKEN", "");
        if telegram_bot_token.is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is required");
        }

        let channel_id = var_or("CHANNEL_ID", "");
        if channel_id.is_empty() {
            bail!("CHANNEL_ID is required");
        }

        let admin_chat_ids = var_or("ADMIN_CHAT_ID", "")
            .split(',')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .collect();

        // Accept a bare path or an sqlite:// URL
        let database_path = {
            let raw = var_or("DATABASE_URL", "./karavan.db");
            raw.strip_prefix("sqlite://")
                .map(str::to_string)
                .unwrap_or(raw)
        };

        let instagram_access_token = env::var("INSTAGRAM_ACCESS_TOKEN")
            .ok()
            .filter(|s| !s.is_empty());
        let instagram_account_id = env::var("INSTAGRAM_ACCOUNT_ID")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            posting_time: var_or("POSTING_TIME", "19:00"),
            timezone: var_or("TIMEZONE", "Asia/Bishkek"),
            rapidapi_key: var_or("RAPIDAPI_KEY", ""),
            openrouter_api_key: var_or("OPENROUTER_API_KEY", ""),
            openai_model: var_or("OPENAI_MODEL", "openai/gpt-4o-mini"),
            openai_timeout_secs: parse_or("OPENAI_TIMEOUT", 30),
            telegram_bot_token,
            channel_id,
            admin_chat_ids,
            contact_username: var_or("CONTACT_USERNAME", "karavan_express"),
            instagram_access_token,
            instagram_account_id,
            dengi_api_url: var_or("DENGI_API_URL", ""),
            dengi_sid: var_or("DENGI_SID", ""),
            dengi_password: var_or("DENGI_PASSWORD", ""),
            dengi_api_version: parse_or("DENGI_API_VERSION", 1005),
            dengi_test_mode: var_or("DENGI_TEST_MODE", "false").to_lowercase() == "true",
            dengi_strict_webhook: var_or("DENGI_STRICT_WEBHOOK", "false").to_lowercase() == "true",
            database_path,
            min_discount: parse_or("MIN_DISCOUNT", 0),
            min_rating: parse_or("MIN_RATING", 0.0),
            top_limit: parse_or("TOP_LIMIT", 10),
            max_products: parse_or("MAX_PRODUCTS", 10),
            port: parse_or("PORT", 8080),
        })
    }

    /// Mirror publishing is active only when both credentials are present.
    pub fn mirror_enabled(&self) -> bool {
        self.instagram_access_token.is_some() && self.instagram_account_id.is_some()
    }

    pub fn payments_configured(&self) -> bool {
        !self.dengi_api_url.is_empty() && !self.dengi_sid.is_empty() && !self.dengi_password.is_empty()
    }
}
