//! Marketing-copy generation through a chat-completion endpoint.
//!
//! One call per product, sequential in batches to stay under the provider's
//! rate limits. The caller substitutes the template caption when a call
//! fails; this module only reports the failure.

use crate::errors::ApiError;
use crate::models::Product;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const MAX_TOKENS: u32 = 200;
const TEMPERATURE: f64 = 0.7;

const SYSTEM_PROMPT: &str = "Ты — переводчик и описатель товаров для Telegram канала.\n\
Твоя задача — ПЕРЕВЕСТИ название товара на русский и написать понятное описание.\n\n\
ВАЖНО:\n\
1. ПЕРЕВЕДИ название товара на русский язык\n\
2. Опиши ЧТО ЭТО за товар простыми словами\n\
3. ОБЯЗАТЕЛЬНО укажи примерные характеристики: вес, размеры, материал\n\
4. НЕ пиши цены - они добавятся автоматически\n\n\
ФОРМАТ ОТВЕТА:\n\
🛒 [Название на русском]\n\n\
[Описание товара 2-3 предложения]\n\n\
📏 Характеристики:\n\
• Размер: [примерный размер]\n\
• Вес: [примерный вес]\n\
• Материал: [материал]\n\n\
📩 Для заказа: @{contact}\n\n\
ЗАПРЕЩЕНО:\n\
- Оставлять английские/китайские слова\n\
- Писать \"надёжный продавец\", \"хит продаж\", \"отличное качество\"\n\
- Писать цены";

#[async_trait]
pub trait CaptionWriter: Send + Sync {
    /// Generate a caption for one product.
    async fn describe(&self, product: &Product) -> Result<String, ApiError>;

    /// Sequential batch; one result per product, parallel to the input.
    async fn describe_batch(&self, products: &[Product]) -> Vec<Result<String, ApiError>> {
        let mut results = Vec::with_capacity(products.len());
        for product in products {
            results.push(self.describe(product).await);
        }
        results
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct TextGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    timeout: Duration,
    contact_username: String,
}

impl TextGenerator {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        model: String,
        timeout: Duration,
        contact_username: String,
    ) -> Self {
        Self {
            client,
            api_key,
            model,
            timeout,
            contact_username,
        }
    }

    fn user_prompt(product: &Product) -> String {
        format!(
            "Товар: {}\n\nЦЕНЫ:\n- Было: {} сом\n- Стало: {} сом\n- Экономия: {} сом\n- Скидка: {}%\n\n\
             Напиши короткое цепляющее описание с акцентом на выгоду.",
            product.title,
            product.old_price_local,
            product.price_local,
            product.savings(),
            product.discount_pct,
        )
    }

    /// Template caption used when generation fails. Prices are appended by
    /// the caption formatter, never here.
    pub fn fallback_caption(title: &str, contact_username: &str) -> String {
        let title: String = title.chars().take(80).collect();
        let mut chars = title.chars();
        let title = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => title,
        };
        format!("🛒 {title}\n\n📩 Для заказа: @{contact_username}")
    }

    pub fn contact_username(&self) -> &str {
        &self.contact_username
    }
}

#[async_trait]
impl CaptionWriter for TextGenerator {
    async fn describe(&self, product: &Product) -> Result<String, ApiError> {
        debug!("generating caption for {}", product.id);

        let system = SYSTEM_PROMPT.replace("{contact}", &self.contact_username);
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": Self::user_prompt(product)},
            ],
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
        });

        // Single attempt per product: the template fallback is cheaper than
        // stacking retries on a 30 s endpoint for ten items.
        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(ApiError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("completion endpoint returned {}", status);
            if status.is_server_error() {
                return Err(ApiError::Transient(format!("completion: HTTP {status}")));
            }
            return Err(ApiError::Permanent {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("completion response: {e}")))?;

        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::Schema("empty completion content".into()))?;

        info!("caption generated for {} ({} chars)", product.id, content.chars().count());
        Ok(content.to_string())
    }
}
