//! Caption and message formatting for both publishing surfaces.
//!
//! Broadcast captions are HTML and capped at 1024 chars with the price block
//! always intact; mirror captions are plain text capped at 2200 chars with
//! hashtags trimmed first.

use crate::models::Product;
use crate::services::cards::format_price;

pub const MAX_BROADCAST_CAPTION: usize = 1024;
pub const MAX_MIRROR_CAPTION: usize = 2200;

const INDEX_EMOJIS: &[&str] = &["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣", "🔟"];

const MIRROR_CONTACT: &str = "📲 Заказ: @karavan_express или kv.kg\n📦 Доставка 7-14 дней";

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Intro message sent before the media album.
pub fn intro_text() -> String {
    "🔥 <b>Горячая подборка товаров!</b>\n\n\
     Нажмите на фото, чтобы увидеть описание и цену 👇"
        .to_string()
}

/// Deterministic price block appended to every caption.
pub fn price_block(product: &Product) -> String {
    format!(
        "\n\n💰 <s>{} сом</s> → <b>{} сом</b>\n🔥 Экономия: {} сом!",
        format_price(product.old_price_local),
        format_price(product.price_local),
        format_price(product.savings()),
    )
}

/// Description + price block, within the broadcast caption limit. The
/// description gives way; the price block never does.
pub fn build_caption(description: &str, product: &Product) -> String {
    let block = price_block(product);
    let caption = format!("{description}{block}");
    if caption.chars().count() <= MAX_BROADCAST_CAPTION {
        return caption;
    }

    let block_len = block.chars().count();
    let max_desc = MAX_BROADCAST_CAPTION.saturating_sub(block_len + 10);
    let truncated: String = description.chars().take(max_desc).collect();
    format!("{truncated}...{block}")
}

/// Mirror carousel caption: headline, indexed product lines, contact block,
/// hashtags. Hashtags are dropped from the end until the budget fits.
pub fn build_mirror_caption(products: &[Product], hashtags: &[String]) -> String {
    let mut lines = vec![format!("🔥 ТОП-{} ТОВАРОВ ДНЯ", products.len()), String::new()];

    for (i, product) in products.iter().enumerate() {
        let index = INDEX_EMOJIS.get(i).copied().unwrap_or("▪️");
        let title: String = product.title.chars().take(60).collect();
        lines.push(format!(
            "{index} {title}\n💰 {} сом (-{}%)",
            format_price(product.price_local),
            product.discount_pct
        ));
        lines.push(String::new());
    }

    lines.push(MIRROR_CONTACT.to_string());
    let body = lines.join("\n");

    let mut kept = hashtags.to_vec();
    loop {
        let caption = if kept.is_empty() {
            body.clone()
        } else {
            format!("{body}\n\n{}", kept.join(" "))
        };
        if caption.chars().count() <= MAX_MIRROR_CAPTION || kept.is_empty() {
            if caption.chars().count() > MAX_MIRROR_CAPTION {
                // Pathological product list; cut the body as a last resort
                return caption.chars().take(MAX_MIRROR_CAPTION).collect();
            }
            return caption;
        }
        kept.pop();
    }
}
