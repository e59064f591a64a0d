//! End-to-end pipeline scenarios over mock services, plus the payment
//! finalisation flow. Every external boundary is a hand-written double;
//! persistence is a real in-memory database.

use async_trait::async_trait;
use karavan_backend::db::Database;
use karavan_backend::errors::ApiError;
use karavan_backend::marketplaces::Marketplace;
use karavan_backend::models::{PostStatus, Product, RawProduct, Source};
use karavan_backend::payments::{InvoiceLifecycle, PaymentGateway};
use karavan_backend::pipeline::{
    DailyPipeline, FallbackUsed, PipelineServices, ProductFilter,
};
use karavan_backend::services::cards::CardRenderer;
use karavan_backend::services::currency::{RateFeed, RateOrigin, RateQuote};
use karavan_backend::services::images::ImageFetcher;
use karavan_backend::services::instagram::{CarouselPublisher, InstagramPublisher};
use karavan_backend::services::notifier::Notifier;
use karavan_backend::services::telegram::ChannelPublisher;
use karavan_backend::services::textgen::CaptionWriter;
use karavan_backend::pipeline::pricing;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

fn raw_product(id: &str, source: Source, price_native: f64, sales: i64) -> RawProduct {
    RawProduct {
        id: id.to_string(),
        title: format!("product {id}"),
        price_native,
        image_url: format!("https://img.example.com/{id}.jpg"),
        rating: 4.6,
        discount_pct: 30,
        sales_count: sales,
        source,
    }
}

// ---- mock services ---------------------------------------------------------

struct MockMarketplace {
    source: Source,
    products: Vec<RawProduct>,
    fail: bool,
}

#[async_trait]
impl Marketplace for MockMarketplace {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, _term: &str, page_size: usize) -> Result<Vec<RawProduct>, ApiError> {
        if self.fail {
            return Err(ApiError::Transient("503 service unavailable".into()));
        }
        Ok(self.products.iter().take(page_size).cloned().collect())
    }
}

struct MockRateFeed {
    rate: f64,
    origin: RateOrigin,
}

#[async_trait]
impl RateFeed for MockRateFeed {
    async fn rate(&self, _from: &str, _to: &str) -> Result<RateQuote, ApiError> {
        Ok(RateQuote {
            rate: self.rate,
            origin: self.origin,
        })
    }
}

struct MockCaptions {
    fail: bool,
}

#[async_trait]
impl CaptionWriter for MockCaptions {
    async fn describe(&self, product: &Product) -> Result<String, ApiError> {
        if self.fail {
            return Err(ApiError::Transient("llm down".into()));
        }
        Ok(format!("Описание {}", product.title))
    }
}

struct MockImages;

#[async_trait]
impl ImageFetcher for MockImages {
    async fn download(&self, url: &str) -> Result<PathBuf, ApiError> {
        let name = url.rsplit('/').next().unwrap_or("img.jpg");
        Ok(PathBuf::from(format!("/tmp/karavan-test/{name}")))
    }

    async fn download_batch(&self, urls: &[String]) -> Vec<Result<PathBuf, ApiError>> {
        let mut out = Vec::new();
        for url in urls {
            out.push(self.download(url).await);
        }
        out
    }
}

/// Pass-through renderer; the album mock never opens the files.
struct PassthroughCards;

impl CardRenderer for PassthroughCards {
    fn render(
        &self,
        image_path: &std::path::Path,
        _price: i64,
        _old_price: i64,
        _discount: i32,
    ) -> Result<PathBuf, ApiError> {
        Ok(image_path.to_path_buf())
    }
}

#[derive(Default)]
struct PublisherLog {
    texts: Vec<String>,
    album_captions: Vec<Vec<String>>,
    album_sizes: Vec<usize>,
    operator_messages: Vec<String>,
    user_messages: Vec<(i64, String)>,
    deleted: Vec<(i64, i64)>,
}

#[derive(Clone)]
struct MockPublisher {
    log: Arc<Mutex<PublisherLog>>,
    fail_media_group: bool,
}

impl MockPublisher {
    fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(PublisherLog::default())),
            fail_media_group: false,
        }
    }
}

#[async_trait]
impl ChannelPublisher for MockPublisher {
    async fn send_text(&self, text: &str) -> Result<i64, ApiError> {
        self.log.lock().texts.push(text.to_string());
        Ok(1)
    }

    async fn send_media_group(
        &self,
        photos: &[PathBuf],
        captions: &[String],
    ) -> Result<Vec<i64>, ApiError> {
        if self.fail_media_group {
            return Err(ApiError::Transient("channel unavailable".into()));
        }
        let mut log = self.log.lock();
        log.album_sizes.push(photos.len());
        log.album_captions.push(captions.to_vec());
        Ok((100..100 + photos.len() as i64).collect())
    }

    async fn notify_operators(&self, text: &str) -> Result<i64, ApiError> {
        self.log.lock().operator_messages.push(text.to_string());
        Ok(500)
    }

    async fn send_to_chat(&self, chat_id: i64, text: &str) -> Result<i64, ApiError> {
        self.log.lock().user_messages.push((chat_id, text.to_string()));
        Ok(900)
    }

    async fn send_photo_url(&self, chat_id: i64, _url: &str, caption: &str) -> Result<i64, ApiError> {
        self.log.lock().user_messages.push((chat_id, caption.to_string()));
        Ok(901)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ApiError> {
        self.log.lock().deleted.push((chat_id, message_id));
        Ok(())
    }

    fn channel_id(&self) -> &str {
        "@karavan_test"
    }
}

enum MirrorBehavior {
    Succeed(&'static str),
    Fail,
}

struct MockMirror {
    behavior: MirrorBehavior,
}

#[async_trait]
impl CarouselPublisher for MockMirror {
    async fn publish_carousel(
        &self,
        _image_urls: &[String],
        _caption: &str,
    ) -> Result<String, ApiError> {
        match self.behavior {
            MirrorBehavior::Succeed(id) => Ok(id.to_string()),
            MirrorBehavior::Fail => Err(ApiError::Transient("mirror down".into())),
        }
    }
}

// ---- harness ---------------------------------------------------------------

struct Harness {
    pipeline: DailyPipeline,
    db: Database,
    publisher: MockPublisher,
}

#[allow(clippy::too_many_arguments)]
fn harness(
    primary: MockMarketplace,
    secondary: Option<MockMarketplace>,
    rate: MockRateFeed,
    captions_fail: bool,
    mirror: Option<Arc<dyn CarouselPublisher>>,
    top_limit: usize,
) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let publisher = MockPublisher::new();
    let publisher_arc: Arc<dyn ChannelPublisher> = Arc::new(publisher.clone());

    let services = PipelineServices {
        primary: Arc::new(primary),
        secondary: secondary.map(|s| Arc::new(s) as Arc<dyn Marketplace>),
        rates: Arc::new(rate),
        captions: Arc::new(MockCaptions { fail: captions_fail }),
        images: Arc::new(MockImages),
        cards: Arc::new(PassthroughCards),
        publisher: publisher_arc.clone(),
        mirror,
        notifier: Arc::new(Notifier::new(publisher_arc)),
        product_store: db.products(),
        post_store: db.posts(),
    };

    let pipeline = DailyPipeline::new(
        services,
        ProductFilter::new(0, 0.0, top_limit),
        "karavan_express".to_string(),
    );

    Harness {
        pipeline,
        db,
        publisher,
    }
}

fn thirty_products() -> (Vec<RawProduct>, Vec<RawProduct>) {
    let mut primary = Vec::new();
    for i in 0..20 {
        primary.push(raw_product(
            &format!("p{i}"),
            Source::Pinduoduo,
            10.0 + i as f64,
            1000 + i as i64,
        ));
    }
    // One runaway bestseller that must rank first whatever the markup draw
    primary[0].sales_count = 1_000_000;

    let secondary: Vec<RawProduct> = (0..10)
        .map(|i| raw_product(&format!("t{i}"), Source::Taobao, 20.0 + i as f64, 500 + i as i64))
        .collect();
    (primary, secondary)
}

// ---- scenarios -------------------------------------------------------------

/// Scenario A: happy path with both sources and a working mirror.
#[tokio::test]
async fn happy_path_publishes_ten_products() {
    let (primary, secondary) = thirty_products();
    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: primary, fail: false },
        Some(MockMarketplace { source: Source::Taobao, products: secondary, fail: false }),
        MockRateFeed { rate: 12.0, origin: RateOrigin::Api },
        false,
        Some(Arc::new(MockMirror { behavior: MirrorBehavior::Succeed("ig_777") })),
        10,
    );

    let result = h.pipeline.run(Some("bags")).await;

    assert!(result.success, "pipeline failed: {:?}", result.error);
    assert_eq!(result.products_count, 10);
    assert_eq!(result.broadcast_message_id, Some(100));
    assert_eq!(result.mirror_post_id.as_deref(), Some("ig_777"));
    assert!(result.fallbacks_used.is_empty());

    let log = h.publisher.log.lock();
    assert_eq!(log.album_sizes, vec![10]);
    let captions = &log.album_captions[0];
    assert_eq!(captions.len(), 10);
    for caption in captions {
        assert!(caption.chars().count() <= 1024);
        assert!(caption.ends_with("сом!"), "caption missing price block: {caption}");
        assert!(caption.contains("Описание"));
    }

    // The run's highest-profitability product leads the album
    assert!(captions[0].contains("product p0"));

    // Post row: PUBLISHED with both ids, prices pretty-rounded at rate 12
    let (posts, total) = h.db.posts().list(1, 10, None).unwrap();
    assert_eq!(total, 1);
    let post = &posts[0];
    assert_eq!(post.status, PostStatus::Published);
    assert_eq!(post.broadcast_message_id, Some(100));
    assert_eq!(post.mirror_post_id.as_deref(), Some("ig_777"));

    let snapshot = post.products_json.as_array().unwrap();
    assert_eq!(snapshot.len(), 10);
    for item in snapshot {
        let native = item["price_native"].as_f64().unwrap();
        let local = item["price_local"].as_i64().unwrap();
        let old = item["old_price_local"].as_i64().unwrap();
        assert_eq!(local, pricing::round_to_pretty(native * 12.0));
        assert!(old >= local);
        assert_eq!(
            item["discount_pct"].as_i64().unwrap(),
            pricing::display_discount(local, old) as i64
        );
    }
}

/// Scenario A variant: mirror errors downgrade the run to MIRROR_FAILED
/// without failing it.
#[tokio::test]
async fn mirror_failure_degrades_but_run_succeeds() {
    let (primary, secondary) = thirty_products();
    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: primary, fail: false },
        Some(MockMarketplace { source: Source::Taobao, products: secondary, fail: false }),
        MockRateFeed { rate: 12.0, origin: RateOrigin::Api },
        false,
        Some(Arc::new(MockMirror { behavior: MirrorBehavior::Fail })),
        10,
    );

    let result = h.pipeline.run(Some("bags")).await;

    assert!(result.success);
    assert_eq!(result.mirror_post_id, None);
    assert!(result.fallbacks_used.contains(&FallbackUsed::MirrorSkipped));

    let (posts, _) = h.db.posts().list(1, 10, None).unwrap();
    assert_eq!(posts[0].status, PostStatus::MirrorFailed);
    assert!(posts[0].broadcast_message_id.is_some());
    assert!(posts[0].mirror_post_id.is_none());

    // Secondary partial-failure notification names the degradation
    let log = h.publisher.log.lock();
    assert!(log
        .operator_messages
        .iter()
        .any(|m| m.contains("Частичный сбой")));
}

/// Scenario B: marketplace outage with a cache hit.
#[tokio::test]
async fn marketplace_outage_falls_back_to_cache() {
    let db_seed: Vec<RawProduct> = (0..15)
        .map(|i| raw_product(&format!("c{i}"), Source::Pinduoduo, 15.0, 300 + i as i64))
        .collect();

    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: vec![], fail: true },
        None,
        MockRateFeed { rate: 12.0, origin: RateOrigin::Api },
        false,
        None,
        10,
    );
    h.db.products().upsert(&db_seed, "bags").unwrap();

    let result = h.pipeline.run(Some("bags")).await;

    assert!(result.success, "pipeline failed: {:?}", result.error);
    assert!(result.fallbacks_used.contains(&FallbackUsed::CachedProducts));
    assert!(result.products_count > 0);

    let log = h.publisher.log.lock();
    assert!(log
        .operator_messages
        .iter()
        .any(|m| m.contains("кэшированные товары")));
}

/// Scenario B continued: outage with an empty cache aborts at stage 1 and
/// pages the operators with recommendations.
#[tokio::test]
async fn outage_without_cache_aborts_with_error_notification() {
    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: vec![], fail: true },
        None,
        MockRateFeed { rate: 12.0, origin: RateOrigin::Api },
        false,
        None,
        10,
    );

    let result = h.pipeline.run(Some("bags")).await;

    assert!(!result.success);
    assert_eq!(
        result.failed_stage().map(|s| s.as_str()),
        Some("fetch_products")
    );

    let log = h.publisher.log.lock();
    assert!(log
        .operator_messages
        .iter()
        .any(|m| m.contains("Ошибка публикации") && m.contains("Рекомендации")));
    // No post row for an aborted run
    let (_, total) = h.db.posts().list(1, 10, None).unwrap();
    assert_eq!(total, 0);
}

/// Scenario C: currency API down, stored rate drives stage 2.
#[tokio::test]
async fn currency_db_fallback_is_used_and_reported() {
    let (primary, _) = thirty_products();
    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: primary, fail: false },
        None,
        MockRateFeed { rate: 11.8, origin: RateOrigin::DbFallback },
        false,
        None,
        10,
    );

    let result = h.pipeline.run(Some("bags")).await;

    assert!(result.success);
    assert!(result.fallbacks_used.contains(&FallbackUsed::CurrencyDb));

    let (posts, _) = h.db.posts().list(1, 10, None).unwrap();
    let snapshot = posts[0].products_json.as_array().unwrap();
    for item in snapshot {
        let native = item["price_native"].as_f64().unwrap();
        let local = item["price_local"].as_i64().unwrap();
        assert_eq!(local, pricing::round_to_pretty(native * 11.8));
    }
}

/// Scenario E: a single survivor still broadcasts; the real mirror rejects
/// the one-item carousel as a business-rule failure and the post degrades.
#[tokio::test]
async fn single_product_carousel_is_rejected_but_broadcast_survives() {
    let one = vec![raw_product("solo", Source::Pinduoduo, 10.0, 42)];
    let mirror: Arc<dyn CarouselPublisher> = Arc::new(InstagramPublisher::new(
        reqwest::Client::new(),
        "token".into(),
        "acct".into(),
    ));

    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: one, fail: false },
        None,
        MockRateFeed { rate: 12.0, origin: RateOrigin::Api },
        false,
        Some(mirror),
        10,
    );

    let result = h.pipeline.run(Some("bags")).await;

    assert!(result.success);
    assert_eq!(result.products_count, 1);
    assert!(result.fallbacks_used.contains(&FallbackUsed::MirrorSkipped));

    let log = h.publisher.log.lock();
    assert_eq!(log.album_sizes, vec![1]);
    drop(log);

    let (posts, _) = h.db.posts().list(1, 10, None).unwrap();
    assert_eq!(posts[0].status, PostStatus::MirrorFailed);
}

/// Template fallback: caption generation down, the run degrades to
/// templates and says so.
#[tokio::test]
async fn caption_failure_uses_template_fallback() {
    let (primary, _) = thirty_products();
    let h = harness(
        MockMarketplace { source: Source::Pinduoduo, products: primary, fail: false },
        None,
        MockRateFeed { rate: 12.0, origin: RateOrigin::Api },
        true,
        None,
        10,
    );

    let result = h.pipeline.run(Some("bags")).await;

    assert!(result.success);
    assert!(result.fallbacks_used.contains(&FallbackUsed::TemplateText));

    let log = h.publisher.log.lock();
    let captions = &log.album_captions[0];
    assert!(captions.iter().all(|c| c.contains("Для заказа: @karavan_express")));
    assert!(captions.iter().all(|c| c.ends_with("сом!")));
}

/// Broadcast failure is fatal: no post row, operators paged.
#[tokio::test]
async fn broadcast_failure_aborts_the_run() {
    let (primary, _) = thirty_products();
    let db = Database::open_in_memory().unwrap();
    let mut publisher = MockPublisher::new();
    publisher.fail_media_group = true;
    let publisher_arc: Arc<dyn ChannelPublisher> = Arc::new(publisher.clone());

    let pipeline = DailyPipeline::new(
        PipelineServices {
            primary: Arc::new(MockMarketplace {
                source: Source::Pinduoduo,
                products: primary,
                fail: false,
            }),
            secondary: None,
            rates: Arc::new(MockRateFeed { rate: 12.0, origin: RateOrigin::Api }),
            captions: Arc::new(MockCaptions { fail: false }),
            images: Arc::new(MockImages),
            cards: Arc::new(PassthroughCards),
            publisher: publisher_arc.clone(),
            mirror: None,
            notifier: Arc::new(Notifier::new(publisher_arc)),
            product_store: db.products(),
            post_store: db.posts(),
        },
        ProductFilter::new(0, 0.0, 10),
        "karavan_express".to_string(),
    );

    let result = pipeline.run(Some("bags")).await;

    assert!(!result.success);
    assert_eq!(
        result.failed_stage().map(|s| s.as_str()),
        Some("publish_broadcast")
    );
    let (_, total) = db.posts().list(1, 10, None).unwrap();
    assert_eq!(total, 0);
}

// ---- payment finalisation --------------------------------------------------

fn lifecycle_with(db: &Database, publisher: &MockPublisher) -> InvoiceLifecycle {
    let gateway = Arc::new(PaymentGateway::new(
        reqwest::Client::new(),
        "https://pay.example.test/api".into(),
        "sid".into(),
        "k".into(),
        1005,
        true,
        false,
    ));
    InvoiceLifecycle::new(gateway, db.invoices(), Arc::new(publisher.clone()))
}

/// Scenario F: finalise transitions PENDING exactly once; the second call
/// reports success without duplicating side effects.
#[tokio::test]
async fn finalise_is_idempotent_with_one_notification() {
    let db = Database::open_in_memory().unwrap();
    let publisher = MockPublisher::new();
    let lifecycle = lifecycle_with(&db, &publisher);

    db.invoices()
        .create("INV-1", "KV-5002", 77001, 5000, "Доставка", Some("qr"))
        .unwrap();
    db.invoices().set_message_id("INV-1", 42).unwrap();

    assert!(lifecycle.finalise("INV-1").await.unwrap());
    assert!(lifecycle.finalise("INV-1").await.unwrap());

    let log = publisher.log.lock();
    assert_eq!(log.deleted, vec![(77001, 42)]);
    assert_eq!(log.user_messages.len(), 1);
    assert_eq!(log.operator_messages.len(), 1);
    assert!(log.operator_messages[0].contains("KV-5002"));
    drop(log);

    let invoice = db.invoices().get("INV-1").unwrap().unwrap();
    assert_eq!(invoice.status.as_str(), "paid");
    assert!(invoice.paid_at.is_some());

    // Unknown ids report failure without side effects
    assert!(!lifecycle.finalise("NOPE").await.unwrap());
}

/// Scenario F: webhook verification gates the transition.
#[tokio::test]
async fn webhook_signature_gates_finalisation() {
    use karavan_backend::payments::signature::sign_envelope;
    use serde_json::json;

    let db = Database::open_in_memory().unwrap();
    let publisher = MockPublisher::new();
    let lifecycle = lifecycle_with(&db, &publisher);

    db.invoices()
        .create("A", "KV-1", 77001, 100, "Доставка", None)
        .unwrap();

    // Valid signature over a PAID event finalises the invoice
    let signed = sign_envelope(json!({"invoice_id": "A", "status_pay": 1}), "k");
    assert!(lifecycle.handle_webhook(&signed).await.unwrap());
    assert_eq!(
        db.invoices().get("A").unwrap().unwrap().status.as_str(),
        "paid"
    );

    // Tampering after signing must be rejected with no state change
    db.invoices()
        .create("B", "KV-2", 77002, 100, "Доставка", None)
        .unwrap();
    let mut tampered = sign_envelope(json!({"invoice_id": "B", "status_pay": 0}), "k");
    tampered["status_pay"] = json!(1);
    assert!(matches!(
        lifecycle.handle_webhook(&tampered).await,
        Err(ApiError::SignatureInvalid)
    ));
    assert_eq!(
        db.invoices().get("B").unwrap().unwrap().status.as_str(),
        "pending"
    );

    // Legacy: missing hash is accepted (with a warning)
    let legacy = json!({"invoice_id": "B", "status_pay": 1});
    assert!(lifecycle.handle_webhook(&legacy).await.unwrap());
    assert_eq!(
        db.invoices().get("B").unwrap().unwrap().status.as_str(),
        "paid"
    );

    // Non-PAID statuses are acknowledged but not finalised
    db.invoices()
        .create("C", "KV-3", 77003, 100, "Доставка", None)
        .unwrap();
    let cancelled = sign_envelope(json!({"invoice_id": "C", "status_pay": -1}), "k");
    assert!(!lifecycle.handle_webhook(&cancelled).await.unwrap());
    assert_eq!(
        db.invoices().get("C").unwrap().unwrap().status.as_str(),
        "cancelled"
    );
}
