//! Ten-stage daily pipeline.
//!
//! Stages 1-7 are fatal: any failure aborts the run and pages the
//! operators. Stage 8 (mirror) only degrades the post status. Stages 9-10
//! are best effort. Every degradation is tracked in `fallbacks_used` and
//! reported once, after the run, as a partial failure.

use crate::db::{PostStore, ProductStore};
use crate::errors::ApiError;
use crate::marketplaces::Marketplace;
use crate::models::{PostStatus, Product, ProductSnapshot, RawProduct};
use crate::pipeline::filter::ProductFilter;
use crate::pipeline::rotation;
use crate::pipeline::{pricing, FallbackUsed, PipelineStage};
use crate::services::cards::CardRenderer;
use crate::services::currency::{RateFeed, RateOrigin};
use crate::services::formatter;
use crate::services::hashtags::HashtagGenerator;
use crate::services::images::ImageFetcher;
use crate::services::instagram::CarouselPublisher;
use crate::services::notifier::Notifier;
use crate::services::telegram::ChannelPublisher;
use crate::services::textgen::{CaptionWriter, TextGenerator};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Total fetch target across the day's categories.
const FETCH_TARGET: usize = 30;
const MIN_PER_CATEGORY: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: PipelineStage,
    pub success: bool,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    fn ok(stage: PipelineStage, started: Instant) -> Self {
        Self {
            stage,
            success: true,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: None,
        }
    }

    fn failed(stage: PipelineStage, started: Instant, error: impl Into<String>) -> Self {
        Self {
            stage,
            success: false,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub total_duration_ms: f64,
    pub stages: Vec<StageResult>,
    pub broadcast_message_id: Option<i64>,
    pub mirror_post_id: Option<String>,
    pub post_id: Option<i64>,
    pub products_count: usize,
    pub error: Option<String>,
    pub fallbacks_used: Vec<FallbackUsed>,
}

impl PipelineResult {
    pub fn failed_stage(&self) -> Option<PipelineStage> {
        self.stages.iter().find(|s| !s.success).map(|s| s.stage)
    }
}

/// Service handles the orchestrator owns. Everything is injected; test
/// doubles replace any boundary.
pub struct PipelineServices {
    pub primary: Arc<dyn Marketplace>,
    pub secondary: Option<Arc<dyn Marketplace>>,
    pub rates: Arc<dyn RateFeed>,
    pub captions: Arc<dyn CaptionWriter>,
    pub images: Arc<dyn ImageFetcher>,
    pub cards: Arc<dyn CardRenderer>,
    pub publisher: Arc<dyn ChannelPublisher>,
    pub mirror: Option<Arc<dyn CarouselPublisher>>,
    pub notifier: Arc<Notifier>,
    pub product_store: ProductStore,
    pub post_store: PostStore,
}

pub struct DailyPipeline {
    services: PipelineServices,
    filter: ProductFilter,
    hashtags: HashtagGenerator,
    contact_username: String,
}

/// One product with its derived artefacts, kept aligned through the stages.
struct PostItem {
    product: Product,
    caption_text: String,
    card_path: PathBuf,
}

impl DailyPipeline {
    pub fn new(services: PipelineServices, filter: ProductFilter, contact_username: String) -> Self {
        Self {
            services,
            filter,
            hashtags: HashtagGenerator::new(),
            contact_username,
        }
    }

    /// Execute the full pipeline. `category_hint` narrows Stage 1 to a
    /// single category (operator-triggered test posts).
    pub async fn run(&self, category_hint: Option<&str>) -> PipelineResult {
        let run_started = Instant::now();
        let mut stages: Vec<StageResult> = Vec::new();
        let mut fallbacks: Vec<FallbackUsed> = Vec::new();

        let categories = match category_hint {
            Some(hint) => vec![hint.to_string()],
            None => rotation::categories_for(Utc::now().date_naive()),
        };

        info!("pipeline starting: categories {:?}", categories);

        // Stage 1: fetch
        let started = Instant::now();
        let raw_products = match self.fetch_products(&categories, &mut fallbacks).await {
            Ok(products) => {
                stages.push(StageResult::ok(PipelineStage::FetchProducts, started));
                products
            }
            Err(e) => {
                stages.push(StageResult::failed(PipelineStage::FetchProducts, started, e.to_string()));
                return self.abort(stages, fallbacks, run_started).await;
            }
        };

        // Stage 2: price conversion
        let started = Instant::now();
        let products = match self.convert_prices(&raw_products, &mut fallbacks).await {
            Ok(products) => {
                stages.push(StageResult::ok(PipelineStage::ConvertPrices, started));
                products
            }
            Err(e) => {
                stages.push(StageResult::failed(PipelineStage::ConvertPrices, started, e.to_string()));
                return self.abort(stages, fallbacks, run_started).await;
            }
        };

        // Stage 3: filter and rank
        let started = Instant::now();
        let filtered = self.filter.filter(&products);
        if filtered.is_empty() {
            stages.push(StageResult::failed(
                PipelineStage::FilterProducts,
                started,
                "no products passed filters",
            ));
            return self.abort(stages, fallbacks, run_started).await;
        }
        stages.push(StageResult::ok(PipelineStage::FilterProducts, started));

        // Stage 4: captions
        let started = Instant::now();
        let captions = self.generate_captions(&filtered, &mut fallbacks).await;
        stages.push(StageResult::ok(PipelineStage::GenerateContent, started));

        // Stage 5: image downloads
        let started = Instant::now();
        let downloaded = self.download_images(&filtered, &captions).await;
        if downloaded.is_empty() {
            stages.push(StageResult::failed(
                PipelineStage::DownloadImages,
                started,
                "failed to download any images",
            ));
            return self.abort(stages, fallbacks, run_started).await;
        }
        stages.push(StageResult::ok(PipelineStage::DownloadImages, started));

        // Stage 6: cards
        let started = Instant::now();
        let items = self.render_cards(downloaded);
        stages.push(StageResult::ok(PipelineStage::CreateCards, started));

        // Stage 7: broadcast publish
        let started = Instant::now();
        let broadcast_message_id = match self.publish_broadcast(&items).await {
            Ok(id) => {
                stages.push(StageResult::ok(PipelineStage::PublishBroadcast, started));
                id
            }
            Err(e) => {
                stages.push(StageResult::failed(PipelineStage::PublishBroadcast, started, e.to_string()));
                return self.abort(stages, fallbacks, run_started).await;
            }
        };

        // Stage 8: mirror publish (non-fatal)
        let started = Instant::now();
        let mirror_attempted = self.services.mirror.is_some();
        let mirror_post_id = match self.publish_mirror(&items, &categories).await {
            Ok(Some(id)) => {
                stages.push(StageResult::ok(PipelineStage::PublishMirror, started));
                Some(id)
            }
            Ok(None) => {
                // Mirroring not configured; nothing attempted
                stages.push(StageResult::ok(PipelineStage::PublishMirror, started));
                None
            }
            Err(e) => {
                warn!("mirror publish failed: {}", e);
                fallbacks.push(FallbackUsed::MirrorSkipped);
                stages.push(StageResult::failed(PipelineStage::PublishMirror, started, e.to_string()));
                None
            }
        };

        // Stage 9: persist (best effort)
        let started = Instant::now();
        let post_id = match self.save_post(&items, broadcast_message_id, mirror_post_id.as_deref(), mirror_attempted) {
            Ok(id) => {
                stages.push(StageResult::ok(PipelineStage::SaveToDb, started));
                Some(id)
            }
            Err(e) => {
                warn!("persisting post failed: {:#}", e);
                stages.push(StageResult::failed(PipelineStage::SaveToDb, started, e.to_string()));
                None
            }
        };

        // Stage 10: notify (best effort)
        let started = Instant::now();
        let elapsed_ms = run_started.elapsed().as_secs_f64() * 1000.0;
        match self
            .services
            .notifier
            .notify_success(items.len(), elapsed_ms, broadcast_message_id)
            .await
        {
            Ok(_) => stages.push(StageResult::ok(PipelineStage::NotifyOperators, started)),
            Err(e) => {
                warn!("success notification failed: {}", e);
                stages.push(StageResult::failed(PipelineStage::NotifyOperators, started, e.to_string()));
            }
        }

        if !fallbacks.is_empty() {
            if let Err(e) = self.services.notifier.notify_partial_failure(&fallbacks).await {
                warn!("partial-failure notification failed: {}", e);
            }
        }

        let total = run_started.elapsed().as_secs_f64() * 1000.0;
        info!(
            "pipeline completed in {:.0} ms: {} products, broadcast {} mirror {:?}",
            total,
            items.len(),
            broadcast_message_id,
            mirror_post_id
        );

        PipelineResult {
            success: true,
            total_duration_ms: total,
            stages,
            broadcast_message_id: Some(broadcast_message_id),
            mirror_post_id,
            post_id,
            products_count: items.len(),
            error: None,
            fallbacks_used: fallbacks,
        }
    }

    /// Stage 1: fetch from the primary marketplace across today's
    /// categories, cache fallback per failing key, an optional secondary
    /// slice, then shuffle to interleave sources.
    async fn fetch_products(
        &self,
        categories: &[String],
        fallbacks: &mut Vec<FallbackUsed>,
    ) -> Result<Vec<RawProduct>, ApiError> {
        let per_category = MIN_PER_CATEGORY.max(FETCH_TARGET / categories.len().max(1));
        let mut all: Vec<RawProduct> = Vec::new();

        for category in categories {
            let keyword = rotation::keyword_for(category);
            match self.services.primary.fetch(keyword, per_category).await {
                Ok(products) if !products.is_empty() => {
                    if let Err(e) = self.services.product_store.upsert(&products, category) {
                        warn!("caching products for {} failed: {:#}", category, e);
                    }
                    info!("category {}: {} products from api", category, products.len());
                    all.extend(products);
                }
                Ok(_) => {
                    warn!("category {}: empty result", category);
                }
                Err(e) => {
                    warn!("category {} fetch failed ({}), trying cache", category, e);
                    match self.services.product_store.cached_for_category(category, per_category) {
                        Ok(cached) if !cached.is_empty() => {
                            info!("category {}: {} products from cache", category, cached.len());
                            if !fallbacks.contains(&FallbackUsed::CachedProducts) {
                                fallbacks.push(FallbackUsed::CachedProducts);
                            }
                            all.extend(cached);
                        }
                        Ok(_) => warn!("category {}: no cached products either", category),
                        Err(cache_err) => {
                            warn!("category {} cache read failed: {:#}", category, cache_err)
                        }
                    }
                }
            }
        }

        // One secondary slice under a random key for variety
        if let Some(secondary) = &self.services.secondary {
            let category = {
                let mut rng = rand::thread_rng();
                categories[rng.gen_range(0..categories.len())].clone()
            };
            let keyword = category.replace('_', " ");
            match secondary.fetch(&keyword, MIN_PER_CATEGORY).await {
                Ok(products) => {
                    info!("secondary slice '{}': {} products", keyword, products.len());
                    all.extend(products);
                }
                Err(e) => warn!("secondary fetch failed: {}", e),
            }
        }

        if all.is_empty() {
            return Err(ApiError::BusinessRule(format!(
                "no products fetched for any of {categories:?}"
            )));
        }

        all.shuffle(&mut rand::thread_rng());
        Ok(all)
    }

    /// Stage 2: one rate lookup, then conversion and marketing prices.
    async fn convert_prices(
        &self,
        raw_products: &[RawProduct],
        fallbacks: &mut Vec<FallbackUsed>,
    ) -> Result<Vec<Product>, ApiError> {
        let quote = self.services.rates.rate("CNY", "KGS").await?;
        if quote.origin == RateOrigin::DbFallback {
            fallbacks.push(FallbackUsed::CurrencyDb);
        }

        let today = Utc::now().date_naive();
        let products = pricing::convert_products(raw_products, quote.rate, today);
        info!("converted {} products at rate {}", products.len(), quote.rate);
        Ok(products)
    }

    /// Stage 4: one caption per product, template on any failure.
    async fn generate_captions(
        &self,
        products: &[Product],
        fallbacks: &mut Vec<FallbackUsed>,
    ) -> Vec<String> {
        let results = self.services.captions.describe_batch(products).await;

        let mut captions = Vec::with_capacity(products.len());
        let mut used_template = false;
        for (product, result) in products.iter().zip(results) {
            match result {
                Ok(text) => captions.push(text),
                Err(e) => {
                    warn!("caption for {} failed ({}), using template", product.id, e);
                    used_template = true;
                    captions.push(TextGenerator::fallback_caption(
                        &product.title,
                        &self.contact_username,
                    ));
                }
            }
        }

        if used_template {
            fallbacks.push(FallbackUsed::TemplateText);
        }
        captions
    }

    /// Stage 5: bounded-concurrency downloads; failing items drop out with
    /// their captions so everything stays aligned.
    async fn download_images(
        &self,
        products: &[Product],
        captions: &[String],
    ) -> Vec<(Product, String, PathBuf)> {
        let urls: Vec<String> = products.iter().map(|p| p.image_url.clone()).collect();
        let results = self.services.images.download_batch(&urls).await;

        products
            .iter()
            .zip(captions)
            .zip(results)
            .filter_map(|((product, caption), result)| match result {
                Ok(path) => Some((product.clone(), caption.clone(), path)),
                Err(e) => {
                    warn!("image for {} failed: {}", product.id, e);
                    None
                }
            })
            .collect()
    }

    /// Stage 6: render cards; a failing card falls back to the raw photo.
    fn render_cards(&self, downloaded: Vec<(Product, String, PathBuf)>) -> Vec<PostItem> {
        downloaded
            .into_iter()
            .map(|(product, caption_text, image_path)| {
                let card_path = match self.services.cards.render(
                    &image_path,
                    product.price_local,
                    product.old_price_local,
                    product.discount_pct,
                ) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("card for {} failed ({}), using raw photo", product.id, e);
                        image_path
                    }
                };
                PostItem {
                    product,
                    caption_text,
                    card_path,
                }
            })
            .collect()
    }

    /// Stage 7: intro text, then the album with per-item captions. The
    /// album is capped to ten items by construction (top limit <= 10).
    async fn publish_broadcast(&self, items: &[PostItem]) -> Result<i64, ApiError> {
        if let Err(e) = self.services.publisher.send_text(&formatter::intro_text()).await {
            warn!("intro message failed: {}", e);
        }

        let photos: Vec<PathBuf> = items.iter().map(|i| i.card_path.clone()).collect();
        let captions: Vec<String> = items
            .iter()
            .map(|i| formatter::build_caption(&i.caption_text, &i.product))
            .collect();

        let message_ids = self.services.publisher.send_media_group(&photos, &captions).await?;
        message_ids
            .first()
            .copied()
            .ok_or_else(|| ApiError::Schema("media group returned no message ids".into()))
    }

    /// Stage 8: carousel publish through the mirror, when configured.
    /// `Ok(None)` means mirroring is off; errors degrade the run.
    async fn publish_mirror(
        &self,
        items: &[PostItem],
        categories: &[String],
    ) -> Result<Option<String>, ApiError> {
        let Some(mirror) = &self.services.mirror else {
            info!("mirror publishing not configured, skipping");
            return Ok(None);
        };

        let hashtags = self.hashtags.generate(
            categories.first().map(String::as_str),
            items.first().map(|i| i.product.title.as_str()),
        );
        let products: Vec<Product> = items.iter().map(|i| i.product.clone()).collect();
        let caption = formatter::build_mirror_caption(&products, &hashtags);

        // The mirror ingests by public URL; the marketplace CDN images are
        // the only public copies of the artwork.
        let image_urls: Vec<String> = items.iter().map(|i| i.product.image_url.clone()).collect();

        let post_id = mirror.publish_carousel(&image_urls, &caption).await?;
        Ok(Some(post_id))
    }

    /// Stage 9: post row with a status consistent with what happened.
    fn save_post(
        &self,
        items: &[PostItem],
        broadcast_message_id: i64,
        mirror_post_id: Option<&str>,
        mirror_attempted: bool,
    ) -> anyhow::Result<i64> {
        let status = match (mirror_post_id, mirror_attempted) {
            (Some(_), _) => PostStatus::Published,
            (None, true) => PostStatus::MirrorFailed,
            (None, false) => PostStatus::BroadcastOnly,
        };

        let snapshot: Vec<ProductSnapshot> =
            items.iter().map(|i| ProductSnapshot::from(&i.product)).collect();
        let products_json = serde_json::to_value(snapshot)?;

        self.services.post_store.create(
            &products_json,
            Some(broadcast_message_id),
            mirror_post_id,
            status,
        )
    }

    /// Fatal-stage exit: build the failed result and page the operators.
    async fn abort(
        &self,
        stages: Vec<StageResult>,
        fallbacks: Vec<FallbackUsed>,
        run_started: Instant,
    ) -> PipelineResult {
        let failed = stages.iter().find(|s| !s.success);
        let (stage_name, error) = failed
            .map(|s| {
                (
                    s.stage.as_str(),
                    s.error.clone().unwrap_or_else(|| "unknown error".into()),
                )
            })
            .unwrap_or(("unknown", "unknown error".into()));

        if let Err(e) = self.services.notifier.notify_error(stage_name, &error).await {
            warn!("error notification failed: {}", e);
        }

        PipelineResult {
            success: false,
            total_duration_ms: run_started.elapsed().as_secs_f64() * 1000.0,
            stages,
            broadcast_message_id: None,
            mirror_post_id: None,
            post_id: None,
            products_count: 0,
            error: Some(error),
            fallbacks_used: fallbacks,
        }
    }
}
