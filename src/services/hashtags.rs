//! Hashtag generation for mirror captions.
//!
//! Budget: base set + category set + up to five keywords extracted from a
//! product title, capped at fifteen tags total. Base tags always survive the
//! cap; the rest are shuffled before trimming so overflow does not always
//! drop the same tags.

use rand::seq::SliceRandom;
use std::collections::HashSet;

pub const MIN_HASHTAGS: usize = 10;
pub const MAX_HASHTAGS: usize = 15;
const MAX_TITLE_TAGS: usize = 5;

const BASE_HASHTAGS: &[&str] = &[
    "бишкек",
    "кыргызстан",
    "доставкаизкитая",
    "караванэкспресс",
    "китай",
    "карго",
];

const CATEGORY_HASHTAGS: &[(&str, &[&str])] = &[
    (
        "electronics",
        &["техника", "гаджеты", "электроника", "смартфон", "наушники", "аксессуары"],
    ),
    (
        "clothing",
        &["одежда", "мода", "стиль", "одеждаизкитая", "тренды"],
    ),
    (
        "home",
        &["дом", "интерьер", "уют", "декор", "товарыдлядома"],
    ),
    (
        "beauty",
        &["красота", "косметика", "уход", "косметикаизкитая", "макияж"],
    ),
    (
        "kids",
        &["дети", "детскиетовары", "игрушки", "детям", "длядетей"],
    ),
    (
        "auto",
        &["авто", "автотовары", "автоаксессуары", "длямашины"],
    ),
];

const GENERIC_HASHTAGS: &[&str] = &[
    "товарыизкитая",
    "выгодно",
    "скидки",
    "распродажа",
    "акция",
    "качество",
];

/// Rotation/category keys → hashtag category.
const CATEGORY_MAPPING: &[(&str, &str)] = &[
    ("headphones", "electronics"),
    ("gadgets", "electronics"),
    ("electronics", "electronics"),
    ("bags", "clothing"),
    ("clothing", "clothing"),
    ("unisex", "clothing"),
    ("home", "home"),
    ("kitchen", "home"),
    ("beauty", "beauty"),
    ("kids", "kids"),
    ("sports", "clothing"),
    ("auto", "auto"),
];

const STOP_WORDS: &[&str] = &[
    "для", "или", "это", "как", "что", "при", "под", "над", "без", "про", "через",
    "the", "and", "for", "with", "from", "this", "that",
];

#[derive(Debug, Clone, Default)]
pub struct HashtagGenerator;

impl HashtagGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Tags with `#` prefix, at most [`MAX_HASHTAGS`].
    pub fn generate(&self, category: Option<&str>, title: Option<&str>) -> Vec<String> {
        let mut tags: Vec<String> = BASE_HASHTAGS.iter().map(|t| t.to_string()).collect();
        let mut seen: HashSet<String> = tags.iter().cloned().collect();

        if let Some(category) = category {
            for tag in category_tags(category) {
                if seen.insert(tag.to_string()) {
                    tags.push(tag.to_string());
                }
            }
        }

        if let Some(title) = title {
            for tag in title_tags(title) {
                if seen.insert(tag.clone()) {
                    tags.push(tag);
                }
            }
        }

        if tags.len() < MIN_HASHTAGS {
            for tag in GENERIC_HASHTAGS {
                if tags.len() >= MAX_HASHTAGS {
                    break;
                }
                if seen.insert(tag.to_string()) {
                    tags.push(tag.to_string());
                }
            }
        }

        if tags.len() > MAX_HASHTAGS {
            let base_count = BASE_HASHTAGS.len();
            let mut extra: Vec<String> = tags.split_off(base_count);
            extra.shuffle(&mut rand::thread_rng());
            extra.truncate(MAX_HASHTAGS - base_count);
            tags.extend(extra);
        }

        tags.into_iter().map(|t| format!("#{t}")).collect()
    }

    pub fn format_for_post(&self, hashtags: &[String]) -> String {
        hashtags.join(" ")
    }
}

fn category_tags(category: &str) -> &'static [&'static str] {
    let lowered = category.to_lowercase();
    let key = CATEGORY_MAPPING
        .iter()
        .find(|(name, _)| *name == lowered)
        .map(|(_, key)| *key);

    match key {
        Some(key) => CATEGORY_HASHTAGS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, tags)| *tags)
            .unwrap_or(&[]),
        None => &[],
    }
}

/// Up to five keywords from the title: 4-20 letters, no stop words.
fn title_tags(title: &str) -> Vec<String> {
    let lowered = title.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphabetic() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for word in cleaned.split_whitespace() {
        let len = word.chars().count();
        if (4..=20).contains(&len)
            && !STOP_WORDS.contains(&word)
            && !BASE_HASHTAGS.contains(&word)
            && seen.insert(word.to_string())
        {
            tags.push(word.to_string());
            if tags.len() >= MAX_TITLE_TAGS {
                break;
            }
        }
    }
    tags
}
