//! Mirror publisher: two-phase carousel publishing over the Graph API.
//!
//! Per-image "child" containers are created first, then one carousel
//! container referencing them, which is polled until the upstream finishes
//! processing and can be published. The whole flow is an explicit state
//! machine; any failure is terminal for the attempt and the run degrades
//! instead of failing.

use crate::errors::ApiError;
use crate::http::send_with_retry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const GRAPH_API_URL: &str = "https://graph.facebook.com/v18.0";
const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub const MIN_CAROUSEL_ITEMS: usize = 2;
pub const MAX_CAROUSEL_ITEMS: usize = 10;

const CONTAINER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_CONTAINER_POLLS: u32 = 30;

/// Days before expiry at which the access token warrants a warning.
const TOKEN_EXPIRY_WARNING_DAYS: i64 = 7;

/// Progress of one carousel publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarouselPhase {
    Start,
    CreatingChildren,
    CreatingCarousel,
    Polling,
    Publishing,
    Done,
    Failed,
}

#[async_trait]
pub trait CarouselPublisher: Send + Sync {
    /// Publish a carousel of 2-10 public image URLs; returns the post id.
    async fn publish_carousel(&self, image_urls: &[String], caption: &str)
        -> Result<String, ApiError>;
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub is_valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    pub fn days_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_days().max(0))
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.days_until_expiry()
            .map(|days| days < TOKEN_EXPIRY_WARNING_DAYS)
            .unwrap_or(false)
    }
}

pub struct InstagramPublisher {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    account_id: String,
}

impl InstagramPublisher {
    pub fn new(client: reqwest::Client, access_token: String, account_id: String) -> Self {
        Self {
            client,
            base_url: GRAPH_API_URL.to_string(),
            access_token,
            account_id,
        }
    }

    async fn graph_request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let mut query: Vec<(&str, &str)> = params.to_vec();
        query.push(("access_token", self.access_token.as_str()));

        let response = send_with_retry(
            || {
                self.client
                    .request(method.clone(), &url)
                    .timeout(READ_TIMEOUT)
                    .query(&query)
            },
            "graph api",
        )
        .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("graph response: {e}")))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown graph error");
            return Err(ApiError::Permanent {
                status: 200,
                body: message.to_string(),
            });
        }

        Ok(body)
    }

    fn id_from(body: &Value, what: &str) -> Result<String, ApiError> {
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Schema(format!("{what}: missing id")))
    }

    async fn create_child_container(&self, image_url: &str) -> Result<String, ApiError> {
        let body = self
            .graph_request(
                reqwest::Method::POST,
                &format!("{}/media", self.account_id),
                &[("image_url", image_url), ("is_carousel_item", "true")],
            )
            .await?;
        Self::id_from(&body, "child container")
    }

    async fn create_carousel_container(
        &self,
        children: &[String],
        caption: &str,
    ) -> Result<String, ApiError> {
        let children_csv = children.join(",");
        let body = self
            .graph_request(
                reqwest::Method::POST,
                &format!("{}/media", self.account_id),
                &[
                    ("media_type", "CAROUSEL"),
                    ("children", children_csv.as_str()),
                    ("caption", caption),
                ],
            )
            .await?;
        Self::id_from(&body, "carousel container")
    }

    async fn container_status(&self, container_id: &str) -> Result<String, ApiError> {
        let body = self
            .graph_request(
                reqwest::Method::GET,
                container_id,
                &[("fields", "status_code")],
            )
            .await?;
        Ok(body
            .get("status_code")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string())
    }

    async fn publish_container(&self, container_id: &str) -> Result<String, ApiError> {
        let body = self
            .graph_request(
                reqwest::Method::POST,
                &format!("{}/media_publish", self.account_id),
                &[("creation_id", container_id)],
            )
            .await?;
        Self::id_from(&body, "publish")
    }

    /// Token introspection; expiry inside the warning window logs a warning
    /// but never fails the caller.
    pub async fn token_info(&self) -> Result<TokenInfo, ApiError> {
        let body = self
            .graph_request(
                reqwest::Method::GET,
                "debug_token",
                &[("input_token", self.access_token.as_str())],
            )
            .await?;

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        let info = TokenInfo {
            is_valid: data.get("is_valid").and_then(Value::as_bool).unwrap_or(false),
            expires_at: data
                .get("expires_at")
                .and_then(Value::as_i64)
                .filter(|&ts| ts > 0)
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        };

        if info.is_expiring_soon() {
            warn!(
                "mirror access token expires in {} days",
                info.days_until_expiry().unwrap_or(0)
            );
        }

        Ok(info)
    }
}

#[async_trait]
impl CarouselPublisher for InstagramPublisher {
    async fn publish_carousel(
        &self,
        image_urls: &[String],
        caption: &str,
    ) -> Result<String, ApiError> {
        if image_urls.len() < MIN_CAROUSEL_ITEMS {
            return Err(ApiError::BusinessRule(format!(
                "carousel needs at least {} images, got {}",
                MIN_CAROUSEL_ITEMS,
                image_urls.len()
            )));
        }
        if image_urls.len() > MAX_CAROUSEL_ITEMS {
            return Err(ApiError::BusinessRule(format!(
                "carousel allows at most {} images, got {}",
                MAX_CAROUSEL_ITEMS,
                image_urls.len()
            )));
        }

        let mut phase = CarouselPhase::Start;
        let mut children: Vec<String> = Vec::with_capacity(image_urls.len());
        let mut carousel_id = String::new();

        loop {
            match phase {
                CarouselPhase::Start => phase = CarouselPhase::CreatingChildren,

                CarouselPhase::CreatingChildren => {
                    for (i, url) in image_urls.iter().enumerate() {
                        debug!("creating child container {}/{}", i + 1, image_urls.len());
                        match self.create_child_container(url).await {
                            Ok(id) => children.push(id),
                            Err(e) => {
                                warn!("child container {} failed: {}", i + 1, e);
                                return Err(e);
                            }
                        }
                    }
                    phase = CarouselPhase::CreatingCarousel;
                }

                CarouselPhase::CreatingCarousel => {
                    carousel_id = self.create_carousel_container(&children, caption).await?;
                    info!("carousel container {} created", carousel_id);
                    phase = CarouselPhase::Polling;
                }

                CarouselPhase::Polling => {
                    let mut finished = false;
                    for poll in 1..=MAX_CONTAINER_POLLS {
                        match self.container_status(&carousel_id).await? {
                            s if s == "FINISHED" => {
                                finished = true;
                                break;
                            }
                            s if s == "ERROR" => {
                                return Err(ApiError::BusinessRule(
                                    "carousel container processing failed".into(),
                                ));
                            }
                            s => {
                                debug!("container {} poll {}: {}", carousel_id, poll, s);
                                tokio::time::sleep(CONTAINER_POLL_INTERVAL).await;
                            }
                        }
                    }
                    if !finished {
                        return Err(ApiError::Transient(
                            "carousel container processing timed out".into(),
                        ));
                    }
                    phase = CarouselPhase::Publishing;
                }

                CarouselPhase::Publishing => {
                    let post_id = self.publish_container(&carousel_id).await?;
                    info!("carousel published as {}", post_id);
                    return Ok(post_id);
                }

                CarouselPhase::Done | CarouselPhase::Failed => unreachable!("terminal state"),
            }
        }
    }
}
