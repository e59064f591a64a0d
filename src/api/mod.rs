//! Operator HTTP surface: payment webhook, scheduler status, manual
//! pipeline trigger, post history.

use crate::db::Database;
use crate::errors::ApiError;
use crate::models::PostStatus;
use crate::payments::InvoiceLifecycle;
use crate::pipeline::DailyPipeline;
use crate::scheduler::Scheduler;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub pipeline: Arc<DailyPipeline>,
    pub lifecycle: Option<Arc<InvoiceLifecycle>>,
    pub db: Database,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/autopost/status", get(autopost_status))
        .route("/api/autopost/run", post(autopost_run))
        .route("/api/posts", get(list_posts))
        .route("/webhooks/dengi", post(payment_webhook))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn autopost_status(State(state): State<AppState>) -> Json<Value> {
    let scheduler_state = state.scheduler.state();
    Json(json!({
        "running": scheduler_state.running,
        "next_run_at": scheduler_state.next_run_at,
        "posting_time": scheduler_state.posting_time,
        "timezone": scheduler_state.timezone,
    }))
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    category: Option<String>,
}

/// Manual trigger. Goes through the same single-instance gate as the
/// scheduler; a busy pipeline rejects the trigger instead of queueing it.
async fn autopost_run(
    State(state): State<AppState>,
    body: Option<Json<RunRequest>>,
) -> (StatusCode, Json<Value>) {
    let Some(guard) = state.scheduler.try_begin_run() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({"started": false, "reason": "pipeline already running"})),
        );
    };

    let category = body.and_then(|Json(b)| b.category);
    info!("manual pipeline trigger (category: {:?})", category);

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let result = pipeline.run(category.as_deref()).await;
        if !result.success {
            warn!(
                "manual run failed at {:?}: {}",
                result.failed_stage(),
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        drop(guard);
    });

    (StatusCode::ACCEPTED, Json(json!({"started": true})))
}

#[derive(Debug, Deserialize)]
struct PostsQuery {
    page: Option<usize>,
    page_size: Option<usize>,
    status: Option<String>,
}

async fn list_posts(
    State(state): State<AppState>,
    Query(query): Query<PostsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(PostStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unknown status '{raw}'")})),
            )
        })?),
        None => None,
    };

    let (posts, total) = state
        .db
        .posts()
        .list(query.page.unwrap_or(1), query.page_size.unwrap_or(10), status)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        })?;

    Ok(Json(json!({
        "posts": posts,
        "total": total,
    })))
}

/// Inbound payment webhook. Signature failures reject the payload with 403
/// and no state change; a verified PAID event finalises the invoice.
async fn payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(lifecycle) = &state.lifecycle else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "payments not configured"})),
        );
    };

    match lifecycle.handle_webhook(&payload).await {
        Ok(finalised) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "finalised": finalised})),
        ),
        Err(ApiError::SignatureInvalid) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "signature verification failed"})),
        ),
        Err(ApiError::Schema(msg)) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": msg})))
        }
        Err(e) => {
            warn!("webhook processing failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}
