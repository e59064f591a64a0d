//! Karavan - messaging-bot backend for a parcel-delivery business
//! Daily autopost pipeline + payment invoice lifecycle
//!
//! Wiring order: config, database, service clients, pipeline, scheduler,
//! HTTP surface. Background loops are spawned before the server blocks.

use anyhow::{Context, Result};
use clap::Parser;
use karavan_backend::api::{self, AppState};
use karavan_backend::config::Config;
use karavan_backend::db::Database;
use karavan_backend::http::build_client;
use karavan_backend::marketplaces::{Marketplace, PinduoduoClient, TaobaoClient};
use karavan_backend::payments::{InvoiceLifecycle, PaymentGateway};
use karavan_backend::pipeline::{DailyPipeline, PipelineServices, ProductFilter};
use karavan_backend::scheduler::Scheduler;
use karavan_backend::services::{
    cards::DEFAULT_CARD_SIZE, images, CardCompositor, CarouselPublisher, ChannelPublisher,
    CurrencyFeed, ImageDownloader, InstagramPublisher, Notifier, TelegramPublisher, TextGenerator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "karavan", about = "Autopost pipeline and payment backend")]
struct Args {
    /// Run the pipeline once and exit (skips scheduler and HTTP server)
    #[arg(long)]
    run_once: bool,

    /// Category override for --run-once
    #[arg(long)]
    category: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;

    info!("starting karavan backend");

    let db = Database::open(&config.database_path)?;
    let client = build_client(Duration::from_secs(30));

    // Marketplace clients (both ride the one shared RapidAPI key)
    let primary: Arc<dyn Marketplace> = Arc::new(PinduoduoClient::new(
        client.clone(),
        config.rapidapi_key.clone(),
    ));
    let secondary: Option<Arc<dyn Marketplace>> = if config.rapidapi_key.is_empty() {
        None
    } else {
        Some(Arc::new(TaobaoClient::new(
            client.clone(),
            config.rapidapi_key.clone(),
        )))
    };

    let rates = Arc::new(CurrencyFeed::new(client.clone(), db.rates()));
    let captions = Arc::new(TextGenerator::new(
        client.clone(),
        config.openrouter_api_key.clone(),
        config.openai_model.clone(),
        Duration::from_secs(config.openai_timeout_secs),
        config.contact_username.clone(),
    ));

    let image_dir = std::env::temp_dir().join("karavan_images");
    let downloader = Arc::new(
        ImageDownloader::new(client.clone(), image_dir.clone())
            .context("creating image temp store")?,
    );
    let cards = Arc::new(
        CardCompositor::new(image_dir.join("cards"), DEFAULT_CARD_SIZE)
            .context("initialising card compositor")?,
    );

    let publisher: Arc<dyn ChannelPublisher> = Arc::new(TelegramPublisher::new(
        client.clone(),
        config.telegram_bot_token.clone(),
        config.channel_id.clone(),
        config.admin_chat_ids.clone(),
    ));
    let notifier = Arc::new(Notifier::new(publisher.clone()));

    let mirror = if config.mirror_enabled() {
        let instagram = InstagramPublisher::new(
            client.clone(),
            config.instagram_access_token.clone().unwrap_or_default(),
            config.instagram_account_id.clone().unwrap_or_default(),
        );
        // Surface token expiry early; a dying token only degrades runs
        match instagram.token_info().await {
            Ok(token) if !token.is_valid => warn!("mirror access token is invalid"),
            Ok(_) => {}
            Err(e) => warn!("mirror token introspection failed: {}", e),
        }
        Some(Arc::new(instagram) as Arc<dyn CarouselPublisher>)
    } else {
        info!("mirror publishing disabled (no credentials)");
        None
    };

    let lifecycle = if config.payments_configured() {
        let gateway = Arc::new(PaymentGateway::new(
            client.clone(),
            config.dengi_api_url.clone(),
            config.dengi_sid.clone(),
            config.dengi_password.clone(),
            config.dengi_api_version,
            config.dengi_test_mode,
            config.dengi_strict_webhook,
        ));
        Some(Arc::new(InvoiceLifecycle::new(
            gateway,
            db.invoices(),
            publisher.clone(),
        )))
    } else {
        info!("payment gateway disabled (no credentials)");
        None
    };

    let filter = ProductFilter::new(
        config.min_discount,
        config.min_rating,
        config.top_limit.min(config.max_products),
    );

    let pipeline = Arc::new(DailyPipeline::new(
        PipelineServices {
            primary,
            secondary,
            rates,
            captions,
            images: downloader,
            cards,
            publisher: publisher.clone(),
            mirror,
            notifier,
            product_store: db.products(),
            post_store: db.posts(),
        },
        filter,
        config.contact_username.clone(),
    ));

    if args.run_once {
        info!("one-shot run requested");
        let result = pipeline.run(args.category.as_deref()).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return if result.success {
            Ok(())
        } else {
            anyhow::bail!("pipeline failed: {:?}", result.error)
        };
    }

    let scheduler = Arc::new(Scheduler::new(&config.posting_time, &config.timezone)?);
    tokio::spawn(scheduler.clone().run_loop(pipeline.clone()));

    // Daily maintenance: stale cached products out, temp images purged
    {
        let products = db.products();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match products.delete_old(karavan_backend::db::products::OLD_PRODUCT_DAYS) {
                    Ok(deleted) => info!("maintenance: {} stale products removed", deleted),
                    Err(e) => error!("maintenance failed: {:#}", e),
                }
                let purged = images::purge_temp_dirs();
                info!("maintenance: {} temp images purged", purged);
            }
        });
    }

    // Best-effort startup note to operators
    {
        let state = scheduler.state();
        let message = format!(
            "🚀 <b>Karavan backend запущен</b>\n\n\
             📢 Канал: {}\n\
             🕐 Время постинга: {} ({})\n\
             💳 Платежи: {}",
            config.channel_id,
            state.posting_time,
            state.timezone,
            if lifecycle.is_some() { "включены" } else { "выключены" },
        );
        if let Err(e) = publisher.notify_operators(&message).await {
            warn!("startup notification failed: {}", e);
        }
    }

    let app = api::router(AppState {
        scheduler,
        pipeline,
        lifecycle,
        db,
    })
    .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {}", addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await.context("http server")?;

    Ok(())
}
