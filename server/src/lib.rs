pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod validation;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use narration_core::{BgmAsset, JobId, JobRequest, NullSink, Pipeline};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::jobs::{CancelRequest, JobRegistry, JobStatus};
use crate::metrics::{system_metrics, MetricsResponse, PipelineMetrics};
use crate::validation::{validate_narration_request, NarrationRequest};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub registry: JobRegistry,
    pub metrics: Arc<PipelineMetrics>,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(pipeline: Pipeline, config: ServerConfig) -> Self {
        Self {
            pipeline,
            registry: JobRegistry::new(config.max_retained_jobs),
            metrics: Arc::new(PipelineMetrics::new()),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NarrationCreated {
    pub job_id: JobId,
    pub status_url: String,
    pub audio_url: String,
}

pub fn status_url(job_id: JobId) -> String {
    format!("/narrations/{job_id}")
}

pub fn audio_url(job_id: JobId) -> String {
    format!("/narrations/{job_id}/audio")
}

/// All routes, served at the root and again under `/api`.
pub fn routes() -> Router<AppState> {
    let public_api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/bgm", get(list_bgm))
        .route("/narrations", post(create_narration))
        .route("/narrations/stream", get(ws::stream_narration))
        .route("/narrations/{id}", get(narration_status).delete(cancel_narration))
        .route("/narrations/{id}/audio", get(narration_audio));

    // Metrics endpoint - consider adding authentication in production
    let metrics_api = Router::new().route("/metrics", get(metrics_endpoint));

    Router::new().merge(public_api).merge(metrics_api)
}

/// Wrap the routes in the middleware stack and attach the state.
pub fn build_app(state: AppState) -> anyhow::Result<Router> {
    let config = &state.config;

    let cors = cors_layer(config);

    // all requests share one global budget
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(60_000 / u64::from(config.rate_limit_per_minute.max(1)))
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors)
        .into_inner();

    let api = routes();
    Ok(Router::new()
        .merge(api.clone()) // root paths
        .nest("/api", api) // /api prefix
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let permissive = || {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods.clone())
            .allow_headers(Any)
            .allow_credentials(false)
    };

    let Some(allowed_origins) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return permissive();
    };
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        return permissive();
    }
    info!("CORS configured for {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(Any)
        .allow_credentials(false)
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    // a hyphenated uuid is always a valid header value
    let Ok(value) = HeaderValue::from_str(&request_id) else {
        return next.run(request).await;
    };
    request.headers_mut().insert("x-request-id", value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert("x-request-id", value);
    response
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_bgm(State(state): State<AppState>) -> Json<Vec<BgmAsset>> {
    let mut assets = state.pipeline.bgm_library().assets();
    assets.sort_by(|a, b| a.id.cmp(&b.id));
    Json(assets)
}

/// Start a job with no live consumer; the result is fetched later.
pub async fn create_narration(
    State(state): State<AppState>,
    Json(req): Json<NarrationRequest>,
) -> Result<(StatusCode, Json<NarrationCreated>), ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let plan = validate_narration_request(&req)?;
    let total_segments = plan.len();
    let handle = state
        .pipeline
        .start(JobRequest::new(plan, req.emotion.clone()), NullSink);
    let job_id = handle.job_id();
    info!(%job_id, total_segments, emotion = %req.emotion, "Narration job started");
    let _ = state
        .registry
        .track(handle, req.emotion, total_segments, Arc::clone(&state.metrics));

    Ok((
        StatusCode::ACCEPTED,
        Json(NarrationCreated {
            job_id,
            status_url: status_url(job_id),
            audio_url: audio_url(job_id),
        }),
    ))
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::InvalidInput(format!("Invalid job id: {id}")))
}

fn find_job(state: &AppState, id: &str) -> Result<JobStatus, ApiError> {
    let job_id = parse_job_id(id)?;
    state
        .registry
        .get(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown job: {job_id}")))
}

pub async fn narration_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    find_job(&state, &id).map(Json)
}

/// Ask a running job to stop. It ends `failed` with a cancellation reason and
/// keeps whatever audio was already persisted.
pub async fn cancel_narration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobStatus>), ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let job_id = parse_job_id(&id)?;
    match state.registry.cancel(&job_id) {
        CancelRequest::Requested => {
            let status = find_job(&state, &id)?;
            Ok((StatusCode::ACCEPTED, Json(status)))
        }
        CancelRequest::AlreadyFinished => Err(ApiError::Conflict(format!("Job {job_id} has already finished"))),
        CancelRequest::Unknown => Err(ApiError::NotFound(format!("Unknown job: {job_id}"))),
    }
}

/// Serve the persisted composite. A failed job serves its partial file,
/// flagged with `x-narration-partial: true`.
pub async fn narration_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let status = find_job(&state, &id)?;
    if status.outcome.is_none() {
        return Err(ApiError::NotReady(format!(
            "Job {} is still {:?}",
            status.job_id, status.state
        )));
    }
    let Some((path, partial)) = status.audio_path() else {
        return Err(ApiError::NotFound(format!(
            "Job {} has no persisted audio",
            status.job_id
        )));
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::InternalError(format!("Failed to read {}: {e}", path.display())))?;

    Ok((
        [
            (header::CONTENT_TYPE, "audio/wav"),
            (HeaderName::from_static("x-narration-partial"), if partial { "true" } else { "false" }),
        ],
        bytes,
    )
        .into_response())
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let request_count = state.request_count.load(Ordering::Relaxed);
    Json(MetricsResponse {
        timestamp: Utc::now(),
        system: system_metrics(request_count),
        pipeline: state.metrics.snapshot(),
    })
}
