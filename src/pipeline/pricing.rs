//! Price conversion and marketing-price synthesis.
//!
//! Native prices are converted through the day's exchange rate, rounded UP
//! to a "pretty" value so the business never loses money on rounding, then
//! given a synthetic "was" price for the strikethrough display. The markup
//! is sampled deterministically per (product, calendar date): the same
//! product published twice on one day always shows the same old price.

use crate::models::{Product, RawProduct};
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Psychologically attractive price endings, ascending. Conversion picks the
/// smallest entry >= the computed value.
pub const PRETTY_PRICES: &[i64] = &[
    // under 100
    29, 49, 59, 79, 99,
    // 100-300
    149, 199, 249, 299,
    // 300-500
    349, 399, 449, 499,
    // 500-1000
    599, 699, 799, 899, 999,
    // 1000-2000
    1199, 1299, 1499, 1699, 1999,
    // 2000-4000
    2499, 2999, 3499, 3999,
    // 4000-7000
    4499, 4999, 5999, 6999,
    // 7000-10000
    7999, 8999, 9999,
    // 10000-20000
    11999, 12999, 14999, 16999, 19999,
    // 20000-50000
    24999, 29999, 34999, 39999, 49999,
];

const MARKUP_MIN: f64 = 1.30;
const MARKUP_MAX: f64 = 1.50;

/// Native price through the exchange rate, unrounded.
pub fn convert(price_native: f64, rate: f64) -> f64 {
    price_native * rate
}

/// Round a local price up to the nearest pretty value. Above the table
/// maximum the price rounds up to the next thousand minus one.
pub fn round_to_pretty(price: f64) -> i64 {
    let price_int = price.ceil() as i64;

    if price_int <= 0 {
        return PRETTY_PRICES[0];
    }

    for &pretty in PRETTY_PRICES {
        if pretty >= price_int {
            return pretty;
        }
    }

    let thousands = price_int / 1000 + 1;
    thousands * 1000 - 1
}

fn markup_seed(product_id: &str, date: NaiveDate) -> u64 {
    let mut hasher = DefaultHasher::new();
    product_id.hash(&mut hasher);
    date.hash(&mut hasher);
    hasher.finish()
}

/// Synthetic "was" price: pretty price times a markup in [1.30, 1.50],
/// rounded to the nearest ten.
pub fn old_price_for(product_id: &str, date: NaiveDate, price_local: i64) -> i64 {
    let mut rng = StdRng::seed_from_u64(markup_seed(product_id, date));
    let markup: f64 = rng.gen_range(MARKUP_MIN..=MARKUP_MAX);
    let raw = price_local as f64 * markup;
    ((raw / 10.0).round() as i64) * 10
}

/// Displayed discount, recomputed from the two local prices.
pub fn display_discount(price_local: i64, old_price_local: i64) -> i32 {
    if old_price_local <= 0 || old_price_local <= price_local {
        return 0;
    }
    ((1.0 - price_local as f64 / old_price_local as f64) * 100.0).floor() as i32
}

/// Derive a priced product for today's post.
pub fn convert_product(raw: &RawProduct, rate: f64, date: NaiveDate) -> Product {
    let price_local = round_to_pretty(convert(raw.price_native, rate));
    let old_price_local = old_price_for(&raw.id, date, price_local);
    let discount_pct = display_discount(price_local, old_price_local);

    Product {
        id: raw.id.clone(),
        title: raw.title.clone(),
        price_native: raw.price_native,
        price_local,
        old_price_local,
        image_url: raw.image_url.clone(),
        rating: raw.rating,
        discount_pct,
        sales_count: raw.sales_count,
        source: raw.source,
    }
}

pub fn convert_products(products: &[RawProduct], rate: f64, date: NaiveDate) -> Vec<Product> {
    products
        .iter()
        .map(|raw| convert_product(raw, rate, date))
        .collect()
}
