//! Operator notifications: success summaries, failure reports with
//! actionable recommendations, partial-failure digests.

use crate::errors::ApiError;
use crate::pipeline::FallbackUsed;
use crate::services::formatter::escape_html;
use crate::services::telegram::ChannelPublisher;
use chrono::Local;
use std::sync::Arc;
use tracing::{error, info};

/// Canned recommendations keyed by failing stage. Matching is by substring
/// so `fetch_products` hits the marketplace entry.
const STAGE_RECOMMENDATIONS: &[(&str, &[&str])] = &[
    (
        "fetch",
        &[
            "Проверьте API ключ RapidAPI",
            "Проверьте дневной лимит запросов (100/день)",
            "Попробуйте повторить через 1 час",
        ],
    ),
    (
        "convert_prices",
        &[
            "Проверьте доступность API курса валют",
            "Система использует последний известный курс",
        ],
    ),
    (
        "content",
        &[
            "Проверьте баланс OpenRouter аккаунта",
            "Проверьте API ключ",
            "Попробуйте уменьшить размер запроса",
        ],
    ),
    (
        "images",
        &[
            "Проверьте доступность CDN изображений",
            "Проверьте права доступа к временной директории",
        ],
    ),
    (
        "cards",
        &[
            "Проверьте наличие шрифтов с кириллицей",
            "Проверьте свободное место на диске",
        ],
    ),
    (
        "broadcast",
        &[
            "Проверьте bot token",
            "Убедитесь что бот добавлен в канал как админ",
            "Проверьте права бота на отправку сообщений",
        ],
    ),
    (
        "mirror",
        &[
            "Проверьте access token (истекает каждые 60 дней)",
            "Обновите токен в кабинете разработчика",
            "Проверьте привязку бизнес-аккаунта",
        ],
    ),
    (
        "save",
        &[
            "Проверьте доступность базы данных",
            "Проверьте наличие свободного места",
        ],
    ),
];

const DEFAULT_RECOMMENDATIONS: &[&str] = &[
    "Проверьте логи для деталей",
    "Попробуйте перезапустить сервис",
];

/// Link to a published channel post: public channels by username, private
/// ones through the t.me/c/ form without the -100 prefix.
pub fn build_post_link(channel_id: &str, message_id: i64) -> String {
    if let Some(username) = channel_id.strip_prefix('@') {
        return format!("https://t.me/{username}/{message_id}");
    }
    if let Some(numeric) = channel_id.strip_prefix("-100") {
        return format!("https://t.me/c/{numeric}/{message_id}");
    }
    format!("https://t.me/c/{channel_id}/{message_id}")
}

pub fn recommendations_for(stage: &str) -> &'static [&'static str] {
    let stage = stage.to_lowercase();
    STAGE_RECOMMENDATIONS
        .iter()
        .find(|(key, _)| stage.contains(key))
        .map(|(_, recs)| *recs)
        .unwrap_or(DEFAULT_RECOMMENDATIONS)
}

pub struct Notifier {
    publisher: Arc<dyn ChannelPublisher>,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn ChannelPublisher>) -> Self {
        Self { publisher }
    }

    pub async fn notify_success(
        &self,
        product_count: usize,
        elapsed_ms: f64,
        broadcast_message_id: i64,
    ) -> Result<i64, ApiError> {
        let link = build_post_link(self.publisher.channel_id(), broadcast_message_id);
        let message = format!(
            "✅ <b>Пост опубликован!</b>\n\n\
             📦 Товаров: {product_count}\n\
             ⏱ Время: {:.1} c\n\
             🕐 Опубликовано: {}\n\
             🔗 <a href=\"{link}\">Открыть пост</a>",
            elapsed_ms / 1000.0,
            Local::now().format("%H:%M"),
        );

        let result = self.publisher.notify_operators(&message).await;
        match &result {
            Ok(_) => info!("success notification delivered"),
            Err(e) => error!("success notification failed: {}", e),
        }
        result
    }

    pub async fn notify_error(&self, stage: &str, message: &str) -> Result<i64, ApiError> {
        let mut lines = vec![
            "❌ <b>Ошибка публикации</b>".to_string(),
            String::new(),
            format!("📍 Этап: {}", escape_html(stage)),
            format!("⚠️ {}", escape_html(message)),
            String::new(),
            "💡 <b>Рекомендации:</b>".to_string(),
        ];
        for rec in recommendations_for(stage) {
            lines.push(format!("• {}", escape_html(rec)));
        }
        lines.push(String::new());
        lines.push(format!("🕐 Время: {}", Local::now().format("%H:%M")));

        let result = self.publisher.notify_operators(&lines.join("\n")).await;
        if let Err(e) = &result {
            error!("error notification failed: {}", e);
        }
        result
    }

    /// Secondary notification when the run succeeded but degraded through
    /// fallbacks.
    pub async fn notify_partial_failure(
        &self,
        fallbacks: &[FallbackUsed],
    ) -> Result<i64, ApiError> {
        let mut lines = vec!["⚠️ <b>Частичный сбой при публикации:</b>".to_string()];
        for fallback in fallbacks {
            lines.push(format!("• {}", fallback.describe()));
        }

        let result = self.publisher.notify_operators(&lines.join("\n")).await;
        if let Err(e) = &result {
            error!("partial-failure notification failed: {}", e);
        }
        result
    }
}
