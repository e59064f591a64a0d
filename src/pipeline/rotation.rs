//! Category rotation for the daily post.
//!
//! Each day picks a small group of category keys from a fixed table indexed
//! by day-of-year, so the channel cycles through product mixes instead of
//! repeating the same search every evening.

use chrono::{Datelike, NaiveDate};

/// Category key → Chinese search keyword (the primary marketplace searches
/// far better in Chinese).
pub const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("headphones", "蓝牙耳机 无线"),
    ("gadgets", "智能手表 数码"),
    ("bags", "背包 双肩包"),
    ("clothing", "卫衣 男女"),
    ("unisex", "休闲服装 男女通用"),
    ("home", "家居 收纳"),
    ("kitchen", "厨房 用品"),
    ("beauty", "护肤 化妆"),
    ("kids", "儿童 玩具"),
    ("sports", "运动 健身"),
    ("auto", "汽车 配件"),
];

/// Daily rotation groups, three keys each for variety.
pub const CATEGORY_GROUPS: &[[&str; 3]] = &[
    ["headphones", "bags", "beauty"],
    ["gadgets", "unisex", "home"],
    ["sports", "kids", "kitchen"],
    ["headphones", "unisex", "beauty"],
    ["gadgets", "bags", "sports"],
    ["home", "kids", "unisex"],
    ["headphones", "kitchen", "unisex"],
    ["gadgets", "beauty", "sports"],
    ["bags", "home", "unisex"],
    ["headphones", "auto", "beauty"],
];

/// Search keyword for a category key. Unknown keys search as themselves so a
/// manual category hint still works.
pub fn keyword_for(category: &str) -> &str {
    CATEGORY_KEYWORDS
        .iter()
        .find(|(key, _)| *key == category)
        .map(|(_, kw)| *kw)
        .unwrap_or(category)
}

/// Today's category group, selected by day-of-year modulo table length.
pub fn categories_for(date: NaiveDate) -> Vec<String> {
    let index = (date.ordinal() as usize) % CATEGORY_GROUPS.len();
    CATEGORY_GROUPS[index].iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rotation_key_has_a_keyword() {
        for group in CATEGORY_GROUPS {
            for key in group {
                assert_ne!(keyword_for(key), *key, "missing keyword for {key}");
            }
        }
    }

    #[test]
    fn rotation_is_stable_per_day_and_cycles() {
        let d1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(categories_for(d1), categories_for(d1));

        let groups: std::collections::HashSet<_> = (0..CATEGORY_GROUPS.len() as u32)
            .map(|i| {
                categories_for(
                    NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                )
            })
            .collect();
        assert_eq!(groups.len(), CATEGORY_GROUPS.len());
    }

    #[test]
    fn unknown_category_searches_as_itself() {
        assert_eq!(keyword_for("drone"), "drone");
    }
}
