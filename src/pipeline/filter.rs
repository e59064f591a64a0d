//! Product filtering, source balancing and ranking.

use crate::models::{Product, Source};
use tracing::{debug, info};

/// Filters and ranks the day's products.
///
/// Each source gets an equal share of the cap so one marketplace cannot
/// monopolise the post. Sources that report no discounts at all (the
/// secondary marketplace often returns zeroes) skip the discount floor and
/// rank by sales volume instead.
#[derive(Debug, Clone)]
pub struct ProductFilter {
    pub min_discount: i32,
    pub min_rating: f64,
    pub top_limit: usize,
}

impl ProductFilter {
    pub fn new(min_discount: i32, min_rating: f64, top_limit: usize) -> Self {
        Self {
            min_discount,
            min_rating,
            top_limit: top_limit.max(1),
        }
    }

    pub fn filter(&self, products: &[Product]) -> Vec<Product> {
        let balanced = self.balance_sources(products);

        let mut result = balanced;
        result.sort_by(|a, b| b.profitability().cmp(&a.profitability()));
        result.truncate(self.top_limit);

        info!(
            "filter complete: {} in, {} out (min_discount={}, min_rating={})",
            products.len(),
            result.len(),
            self.min_discount,
            self.min_rating
        );

        result
    }

    /// Partition by source, filter each partition, take an equal share from
    /// every partition. Sorting is stable, so ties keep insertion order.
    fn balance_sources(&self, products: &[Product]) -> Vec<Product> {
        let mut partitions: Vec<(Source, Vec<Product>)> = Vec::new();
        for product in products {
            match partitions.iter_mut().find(|(s, _)| *s == product.source) {
                Some((_, bucket)) => bucket.push(product.clone()),
                None => partitions.push((product.source, vec![product.clone()])),
            }
        }

        if partitions.is_empty() {
            return Vec::new();
        }

        let per_source_limit = (self.top_limit / partitions.len()).max(1);
        let mut balanced = Vec::new();

        for (source, bucket) in partitions {
            let has_discount_data = bucket.iter().any(|p| p.discount_pct > 0);

            let mut kept: Vec<Product> = bucket
                .into_iter()
                .filter(|p| {
                    let discount_ok =
                        !has_discount_data || self.min_discount == 0 || p.discount_pct >= self.min_discount;
                    discount_ok && p.rating >= self.min_rating
                })
                .collect();

            if has_discount_data {
                kept.sort_by(|a, b| b.profitability().cmp(&a.profitability()));
            } else {
                kept.sort_by(|a, b| b.sales_count.cmp(&a.sales_count));
            }
            kept.truncate(per_source_limit);

            debug!(
                "balanced source {}: selected {} (discount data: {})",
                source,
                kept.len(),
                has_discount_data
            );

            balanced.extend(kept);
        }

        balanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, source: Source, discount: i32, rating: f64, sales: i64) -> Product {
        Product {
            id: id.into(),
            title: format!("product {id}"),
            price_native: 10.0,
            price_local: 199,
            old_price_local: 280,
            image_url: format!("https://img.example.com/{id}.jpg"),
            rating,
            discount_pct: discount,
            sales_count: sales,
            source,
        }
    }

    #[test]
    fn output_is_capped_and_every_item_passes_filters() {
        let products: Vec<Product> = (0..30)
            .map(|i| {
                let source = if i < 20 { Source::Pinduoduo } else { Source::Taobao };
                product(&format!("p{i}"), source, 20 + i as i32, 4.6, 100 + i as i64)
            })
            .collect();

        let filter = ProductFilter::new(10, 4.5, 10);
        let result = filter.filter(&products);

        assert!(result.len() <= 10);
        for p in &result {
            assert!(p.discount_pct >= 10);
            assert!(p.rating >= 4.5);
        }
    }

    #[test]
    fn discount_floor_is_waived_for_sources_without_discount_data() {
        let mut products = vec![
            product("a", Source::Pinduoduo, 40, 4.8, 500),
            product("b", Source::Pinduoduo, 45, 4.9, 400),
        ];
        // Secondary source reports no discounts at all
        products.push(product("t1", Source::Taobao, 0, 4.7, 900));
        products.push(product("t2", Source::Taobao, 0, 4.6, 100));

        let filter = ProductFilter::new(30, 4.5, 10);
        let result = filter.filter(&products);

        assert!(result.iter().any(|p| p.source == Source::Taobao));
    }

    #[test]
    fn sources_share_the_cap_equally() {
        let mut products = Vec::new();
        for i in 0..20 {
            products.push(product(&format!("p{i}"), Source::Pinduoduo, 50, 5.0, 1000));
        }
        for i in 0..20 {
            products.push(product(&format!("t{i}"), Source::Taobao, 50, 5.0, 1000));
        }

        let filter = ProductFilter::new(0, 0.0, 10);
        let result = filter.filter(&products);

        let primary = result.iter().filter(|p| p.source == Source::Pinduoduo).count();
        let secondary = result.iter().filter(|p| p.source == Source::Taobao).count();
        assert_eq!(primary, 5);
        assert_eq!(secondary, 5);
    }

    #[test]
    fn ranking_uses_discount_times_sales() {
        let products = vec![
            product("low", Source::Pinduoduo, 10, 5.0, 100),
            product("high", Source::Pinduoduo, 50, 5.0, 1000),
            product("mid", Source::Pinduoduo, 30, 5.0, 500),
        ];

        let filter = ProductFilter::new(0, 0.0, 3);
        let result = filter.filter(&products);

        assert_eq!(result[0].id, "high");
        assert_eq!(result[1].id, "mid");
        assert_eq!(result[2].id, "low");
    }

    #[test]
    fn ties_keep_insertion_order() {
        let products = vec![
            product("first", Source::Pinduoduo, 30, 5.0, 100),
            product("second", Source::Pinduoduo, 30, 5.0, 100),
        ];

        let filter = ProductFilter::new(0, 0.0, 2);
        let result = filter.filter(&products);

        assert_eq!(result[0].id, "first");
        assert_eq!(result[1].id, "second");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let filter = ProductFilter::new(0, 0.0, 10);
        assert!(filter.filter(&[]).is_empty());
    }
}
