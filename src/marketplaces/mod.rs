//! Marketplace clients and their shared contract.

pub mod pinduoduo;
pub mod taobao;

pub use pinduoduo::PinduoduoClient;
pub use taobao::TaobaoClient;

use crate::errors::ApiError;
use crate::models::{RawProduct, Source};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Contract shared by both marketplace clients.
#[async_trait]
pub trait Marketplace: Send + Sync {
    fn source(&self) -> Source;

    /// Authenticated paginated search, normalised to [`RawProduct`].
    async fn fetch(&self, search_term: &str, page_size: usize) -> Result<Vec<RawProduct>, ApiError>;
}

/// Per-calendar-day soft request cap. The counter resets when the UTC date
/// changes; once it reaches the limit calls fail fast with `RateLimited` and
/// the orchestrator falls back to cached products.
pub struct DailyQuota {
    limit: u32,
    state: Mutex<QuotaState>,
}

struct QuotaState {
    used: u32,
    day: NaiveDate,
}

impl DailyQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: Mutex::new(QuotaState {
                used: 0,
                day: Utc::now().date_naive(),
            }),
        }
    }

    /// Fail fast when today's quota is exhausted.
    pub fn check(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let today = Utc::now().date_naive();
        if state.day != today {
            state.used = 0;
            state.day = today;
        }

        if state.used >= self.limit {
            warn!("daily quota exhausted: {}/{}", state.used, self.limit);
            return Err(ApiError::RateLimited {
                used: state.used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Count one completed request against today's quota.
    pub fn record(&self) {
        let mut state = self.state.lock();
        let today = Utc::now().date_naive();
        if state.day != today {
            state.used = 0;
            state.day = today;
        }
        state.used += 1;
        debug!("quota used {}/{}", state.used, self.limit);
    }

    pub fn remaining(&self) -> u32 {
        let state = self.state.lock();
        if state.day != Utc::now().date_naive() {
            return self.limit;
        }
        self.limit.saturating_sub(state.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_fails_fast_at_limit() {
        let quota = DailyQuota::new(2);
        assert!(quota.check().is_ok());
        quota.record();
        assert!(quota.check().is_ok());
        quota.record();

        match quota.check() {
            Err(ApiError::RateLimited { used, limit }) => {
                assert_eq!(used, 2);
                assert_eq!(limit, 2);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(quota.remaining(), 0);
    }

    #[test]
    fn remaining_counts_down() {
        let quota = DailyQuota::new(100);
        assert_eq!(quota.remaining(), 100);
        quota.record();
        quota.record();
        assert_eq!(quota.remaining(), 98);
    }
}
