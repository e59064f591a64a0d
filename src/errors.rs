//! Typed error taxonomy for external services and stage failures.
//!
//! Every service returns `Result<T, ApiError>`; intermediate layers never
//! translate errors silently. The orchestrator decides fatality per stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// 5xx, timeout or connection failure. Eligible for retry.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 4xx with a usable body. Surfaced without retry.
    #[error("upstream rejected request ({status}): {body}")]
    Permanent { status: u16, body: String },

    /// A client's daily request quota is exhausted.
    #[error("daily rate limit exceeded: {used}/{limit}")]
    RateLimited { used: u32, limit: u32 },

    /// Upstream JSON lacks required fields or has the wrong shape.
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// Webhook signature verification failed; the event must be rejected.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// A caller-visible business constraint, e.g. carousel below minimum.
    #[error("{0}")]
    BusinessRule(String),
}

impl ApiError {
    /// Whether the retry layer should attempt this call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return ApiError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return ApiError::Transient(err.to_string());
            }
            return ApiError::Permanent {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        ApiError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(ApiError::Transient("503".into()).is_transient());
        assert!(!ApiError::Permanent { status: 404, body: "gone".into() }.is_transient());
        assert!(!ApiError::RateLimited { used: 100, limit: 100 }.is_transient());
        assert!(!ApiError::SignatureInvalid.is_transient());
    }
}
