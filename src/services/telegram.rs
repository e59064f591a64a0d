//! Broadcast publisher speaking the Telegram Bot API directly.
//!
//! Covers the channel surface (intro text + media album) and the chat
//! surface the payment flow needs (QR delivery, confirmation, deletion),
//! plus the operator notification fan-out.

use crate::errors::ApiError;
use crate::http::send_with_retry;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

pub const MAX_CAPTION_LENGTH: usize = 1024;
pub const MAX_MESSAGE_LENGTH: usize = 4096;
pub const MAX_MEDIA_GROUP_SIZE: usize = 10;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Album uploads move megabytes; the 5 s ceiling applies to API calls, not
/// the payload transfer.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Publisher contract the orchestrator and payment flow depend on.
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    /// Plain message to the broadcast channel; returns the message id.
    async fn send_text(&self, text: &str) -> Result<i64, ApiError>;

    /// Photo album (1-10 items) with per-item captions; returns all message
    /// ids in order.
    async fn send_media_group(
        &self,
        photos: &[PathBuf],
        captions: &[String],
    ) -> Result<Vec<i64>, ApiError>;

    /// Fan-out to every operator chat; succeeds if at least one delivery
    /// succeeds and returns the first message id.
    async fn notify_operators(&self, text: &str) -> Result<i64, ApiError>;

    /// Direct message to a user chat.
    async fn send_to_chat(&self, chat_id: i64, text: &str) -> Result<i64, ApiError>;

    /// Photo by URL to a user chat (QR codes).
    async fn send_photo_url(&self, chat_id: i64, url: &str, caption: &str)
        -> Result<i64, ApiError>;

    /// Best-effort message deletion.
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ApiError>;

    fn channel_id(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
}

/// Char-safe truncation with a trailing ellipsis.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub struct TelegramPublisher {
    client: reqwest::Client,
    token: String,
    channel_id: String,
    operator_ids: Vec<i64>,
}

impl TelegramPublisher {
    pub fn new(
        client: reqwest::Client,
        token: String,
        channel_id: String,
        operator_ids: Vec<i64>,
    ) -> Self {
        Self {
            client,
            token,
            channel_id,
            operator_ids,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        let url = self.method_url(method);
        let response = send_with_retry(
            || self.client.post(&url).timeout(READ_TIMEOUT).json(&body),
            method,
        )
        .await?;

        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("{method} response: {e}")))?;

        if !parsed.ok {
            return Err(ApiError::Permanent {
                status: 200,
                body: parsed
                    .description
                    .unwrap_or_else(|| format!("{method} failed")),
            });
        }

        parsed
            .result
            .ok_or_else(|| ApiError::Schema(format!("{method}: ok without result")))
    }

    async fn send_message_to(&self, chat_id: serde_json::Value, text: &str) -> Result<i64, ApiError> {
        let text = truncate_with_ellipsis(text, MAX_MESSAGE_LENGTH);
        let message: Message = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                }),
            )
            .await?;
        Ok(message.message_id)
    }
}

#[async_trait]
impl ChannelPublisher for TelegramPublisher {
    async fn send_text(&self, text: &str) -> Result<i64, ApiError> {
        let id = self.send_message_to(json!(self.channel_id), text).await?;
        info!("message {} sent to {}", id, self.channel_id);
        Ok(id)
    }

    async fn send_media_group(
        &self,
        photos: &[PathBuf],
        captions: &[String],
    ) -> Result<Vec<i64>, ApiError> {
        if photos.is_empty() {
            return Err(ApiError::BusinessRule("media group needs at least one photo".into()));
        }
        if photos.len() > MAX_MEDIA_GROUP_SIZE {
            return Err(ApiError::BusinessRule(format!(
                "media group too large: {} (max {})",
                photos.len(),
                MAX_MEDIA_GROUP_SIZE
            )));
        }

        // Files are read up front so the form can be rebuilt per retry.
        let mut files: Vec<(String, Vec<u8>)> = Vec::with_capacity(photos.len());
        for (i, path) in photos.iter().enumerate() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ApiError::BusinessRule(format!("reading {}: {e}", path.display())))?;
            files.push((format!("photo{i}"), bytes));
        }

        let media: Vec<serde_json::Value> = files
            .iter()
            .enumerate()
            .map(|(i, (name, _))| {
                let mut item = json!({
                    "type": "photo",
                    "media": format!("attach://{name}"),
                });
                if let Some(caption) = captions.get(i) {
                    item["caption"] = json!(truncate_with_ellipsis(caption, MAX_CAPTION_LENGTH));
                    item["parse_mode"] = json!("HTML");
                }
                item
            })
            .collect();
        let media_json = serde_json::to_string(&media)
            .map_err(|e| ApiError::Schema(format!("media payload: {e}")))?;

        let url = self.method_url("sendMediaGroup");
        let response = send_with_retry(
            || {
                let mut form = Form::new()
                    .text("chat_id", self.channel_id.clone())
                    .text("media", media_json.clone());
                for (name, bytes) in &files {
                    form = form.part(
                        name.clone(),
                        Part::bytes(bytes.clone())
                            .file_name(format!("{name}.jpg"))
                            .mime_str("image/jpeg")
                            .expect("static mime type"),
                    );
                }
                self.client
                    .post(&url)
                    .timeout(UPLOAD_TIMEOUT)
                    .multipart(form)
            },
            "sendMediaGroup",
        )
        .await?;

        let parsed: ApiResponse<Vec<Message>> = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("sendMediaGroup response: {e}")))?;

        if !parsed.ok {
            return Err(ApiError::Permanent {
                status: 200,
                body: parsed
                    .description
                    .unwrap_or_else(|| "sendMediaGroup failed".into()),
            });
        }

        let ids: Vec<i64> = parsed
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.message_id)
            .collect();

        info!("media group of {} sent to {}", ids.len(), self.channel_id);
        Ok(ids)
    }

    async fn notify_operators(&self, text: &str) -> Result<i64, ApiError> {
        if self.operator_ids.is_empty() {
            return Err(ApiError::BusinessRule("no operator chats configured".into()));
        }

        let mut first_id = None;
        let mut failures = Vec::new();

        for &operator_id in &self.operator_ids {
            match self.send_message_to(json!(operator_id), text).await {
                Ok(id) => {
                    if first_id.is_none() {
                        first_id = Some(id);
                    }
                }
                Err(e) => {
                    error!("operator {} notification failed: {}", operator_id, e);
                    failures.push(format!("{operator_id}: {e}"));
                }
            }
        }

        first_id.ok_or_else(|| ApiError::Permanent {
            status: 200,
            body: format!("all operator notifications failed: {}", failures.join("; ")),
        })
    }

    async fn send_to_chat(&self, chat_id: i64, text: &str) -> Result<i64, ApiError> {
        self.send_message_to(json!(chat_id), text).await
    }

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: &str,
    ) -> Result<i64, ApiError> {
        let message: Message = self
            .call(
                "sendPhoto",
                json!({
                    "chat_id": chat_id,
                    "photo": url,
                    "caption": truncate_with_ellipsis(caption, MAX_CAPTION_LENGTH),
                    "parse_mode": "HTML",
                }),
            )
            .await?;
        Ok(message.message_id)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ApiError> {
        match self
            .call::<bool>(
                "deleteMessage",
                json!({"chat_id": chat_id, "message_id": message_id}),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("deleteMessage {}/{} failed: {}", chat_id, message_id, e);
                Err(e)
            }
        }
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}
