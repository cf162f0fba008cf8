//! API server implementation.
//!
//! Composes the HTTP surface: script generation, user compile, the SSE
//! event stream, and the health/feature/model endpoints. The result relay
//! runs beside the server and feeds the event router; shutdown closes the
//! router first so SSE connections drain inside the grace period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::{Extension, State};
use axum::http::header::{CACHE_CONTROL, HeaderName};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use axum_extra::extract::cookie::Key;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use manimatic_core::{EventEnvelope, MessageQueue, SqsQueue};

use crate::config::{Config, MIN_PROMPT_LEN};
use crate::error::{ApiError, ApiResult};
use crate::features::FeatureKey;
use crate::llm::{LlmService, ModelsResponse, openai, xai};
use crate::relay::ResultRelay;
use crate::router::EventRouter;
use crate::session::{SessionId, ensure_session};

/// Time the HTTP server gets to finish in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,
    /// Session → stream registry.
    pub events: Arc<EventRouter>,
    /// Queue handle (sends to the task queue).
    pub queue: Arc<dyn MessageQueue>,
    /// Language-model provider registry.
    pub llm: Arc<LlmService>,
    cookie_key: Key,
}

impl AppState {
    /// Creates application state with a fresh cookie key.
    #[must_use]
    pub fn new(config: Config, queue: Arc<dyn MessageQueue>, llm: Arc<LlmService>) -> Self {
        Self {
            config: Arc::new(config),
            events: Arc::new(EventRouter::new()),
            queue,
            llm,
            cookie_key: Key::generate(),
        }
    }
}

impl axum::extract::FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Body of `POST /generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Natural-language animation prompt.
    pub prompt: String,
    /// Model id; the default model when absent.
    #[serde(default)]
    pub model: Option<String>,
}

/// Body of `POST /compile`.
#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    /// Animation script to compile as-is.
    pub script: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// GET /healthz - shallow liveness check.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /features - current feature flags.
async fn features(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.features.clone())
}

/// GET /models - available provider model ids and the default.
async fn models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelsResponse {
        models: state.llm.available_models(),
        default_model: state.llm.default_model().to_string(),
    })
}

/// POST /generate - accept a prompt, answer 204, and continue in background.
async fn generate(
    State(state): State<AppState>,
    Extension(session): Extension<SessionId>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<StatusCode> {
    if request.prompt.trim().len() < MIN_PROMPT_LEN {
        return Err(ApiError::bad_request("invalid request body"));
    }

    tokio::spawn(run_generation(state, session, request));
    Ok(StatusCode::NO_CONTENT)
}

/// Background continuation of `/generate`: moderation, generation, enqueue,
/// client notification.
async fn run_generation(state: AppState, SessionId(session_id): SessionId, request: GenerateRequest) {
    let model_label = request
        .model
        .clone()
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| state.llm.default_model().to_string());

    let outcome = match state.llm.generate(&request.prompt, request.model.as_deref()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(session_id = %session_id, error = %err, "failed to generate script");
            publish_to_client(
                &state,
                EventEnvelope::generate_failed(
                    &session_id,
                    "failed to generate script",
                    err.to_string(),
                    &model_label,
                ),
            );
            return;
        }
    };

    if !outcome.valid_input || outcome.code.is_empty() {
        tracing::info!(session_id = %session_id, "generated script flagged as invalid or empty");
        publish_to_client(
            &state,
            EventEnvelope::generate_failed(
                &session_id,
                "failed to generate a scene for the given prompt",
                outcome.warnings,
                &model_label,
            ),
        );
        return;
    }

    tracing::info!(session_id = %session_id, scene = %outcome.scene_name, "generated animation script");

    // Enqueue before notifying the client: a compile request is in the task
    // queue exactly when the client has been told generate_succeeded.
    if let Err(err) = enqueue_compile_request(&state, &session_id, &outcome.code).await {
        tracing::error!(session_id = %session_id, error = %err, "failed to enqueue compile request");
        publish_to_client(
            &state,
            EventEnvelope::generate_failed(
                &session_id,
                "failed to queue the compile request",
                err.to_string(),
                &model_label,
            ),
        );
        return;
    }

    publish_to_client(
        &state,
        EventEnvelope::generate_succeeded(&session_id, outcome.code),
    );
}

/// POST /compile - enqueue a user-edited script (feature-gated).
async fn compile(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
    Json(request): Json<CompileRequest>,
) -> ApiResult<StatusCode> {
    if request.script.trim().len() < MIN_PROMPT_LEN {
        return Err(ApiError::bad_request("invalid request body"));
    }

    tokio::spawn(async move {
        if let Err(err) = enqueue_compile_request(&state, &session_id, &request.script).await {
            tracing::error!(session_id = %session_id, error = %err, "failed to enqueue compile request");
        }
    });
    Ok(StatusCode::NO_CONTENT)
}

/// GET /events - the session's SSE stream, one `data:` frame per event.
async fn events(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
) -> impl IntoResponse {
    let subscription = state.events.subscribe(&session_id);
    let stream = subscription.map(|envelope| SseEvent::default().json_data(&envelope));

    let headers = [
        (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ];
    (headers, Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn enqueue_compile_request(
    state: &AppState,
    session_id: &str,
    script: &str,
) -> manimatic_core::Result<()> {
    let envelope = EventEnvelope::compile_requested(session_id, script);
    state.queue.send(envelope.encode()?).await
}

fn publish_to_client(state: &AppState, envelope: EventEnvelope) {
    let outcome = state.events.publish(&envelope);
    tracing::debug!(
        session_id = %envelope.session_id,
        kind = envelope.kind(),
        outcome = ?outcome,
        "client notification"
    );
}

// ============================================================================
// Router / Server
// ============================================================================

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/features", get(features))
        .route("/models", get(models))
        .route("/generate", post(generate))
        .route("/events", get(events));

    if state.config.features.is_enabled(FeatureKey::UserCompile) {
        router = router.route("/compile", post(compile));
    }

    router
        // Middleware (order matters): trace outermost, then CORS, then the
        // session cookie so handlers always see a SessionId.
        .layer(middleware::from_fn_with_state(state.clone(), ensure_session))
        .layer(cors_layer(&state.config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allowed = allowed_origins.to_vec();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin.to_str().is_ok_and(|origin| {
                    origin.starts_with("http://localhost")
                        || allowed.iter().any(|allowed| allowed == origin)
                })
            },
        ))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

/// Builds the provider registry from the configured keys.
#[must_use]
pub fn build_llm_service(config: &Config) -> LlmService {
    let default_model = if config.openai_api_key.is_some() {
        "gpt-4o"
    } else {
        "grok-2-latest"
    };
    let mut service = LlmService::new(default_model);

    if let Some(key) = &config.openai_api_key {
        let client = openai::register_with(&mut service, key);
        if config.enable_moderation {
            service.set_moderator(client);
        }
    }
    if let Some(key) = &config.xai_api_key {
        xai::register_with(&mut service, key);
    }

    service
}

/// Connects the queue transport and serves until cancellation.
///
/// # Errors
///
/// Returns an error on bind failures or a server fault.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let queue = SqsQueue::connect(
        config.aws_endpoint_url.as_deref(),
        // The API receives results and sends compile requests.
        &config.result_queue_url,
        &config.task_queue_url,
    )
    .await;
    serve(config, Arc::new(queue), cancel).await
}

/// Serves the API over the given queue transport until cancellation.
///
/// # Errors
///
/// Returns an error on bind failures or a server fault.
pub async fn serve(
    config: Config,
    queue: Arc<dyn MessageQueue>,
    cancel: CancellationToken,
) -> Result<()> {
    let llm = Arc::new(build_llm_service(&config));
    let address = format!("{}:{}", config.host, config.port);

    let state = AppState::new(config, Arc::clone(&queue), llm);
    let event_router = Arc::clone(&state.events);

    let relay = ResultRelay::new(queue, Arc::clone(&event_router));
    let relay_handle = tokio::spawn(relay.run(cancel.clone()));

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(address = %address, "API server listening");

    let app = create_router(state);
    let shutdown = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("server task failed")?.context("server error")?;
        }
        () = cancel.cancelled() => {
            tracing::info!("shutting down API server");
            // Closing the router ends every SSE stream, letting in-flight
            // connections finish inside the grace period.
            event_router.shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(result) => {
                    result.context("server task failed")?.context("server error")?;
                }
                Err(_) => {
                    tracing::warn!("server did not drain within the grace period");
                    server.abort();
                }
            }
        }
    }

    let _ = relay_handle.await;
    tracing::info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use manimatic_core::events::EventPayload;
    use manimatic_core::{LogFormat, MemoryQueue};

    use crate::llm::{GenerationOutcome, LlmError, Provider};

    struct StubProvider;

    #[async_trait]
    impl Provider for StubProvider {
        async fn generate(&self, prompt: &str) -> Result<GenerationOutcome, LlmError> {
            if prompt.contains("unrelated") {
                return Ok(GenerationOutcome::default());
            }
            Ok(GenerationOutcome {
                code: "from manim import *".to_string(),
                scene_name: "Generated".to_string(),
                valid_input: true,
                ..GenerationOutcome::default()
            })
        }

        fn model_id(&self) -> &str {
            "stub-model"
        }
    }

    fn test_config(features: &str) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            aws_endpoint_url: None,
            task_queue_url: "http://localhost/task".to_string(),
            result_queue_url: "http://localhost/result".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            enable_moderation: false,
            features: crate::features::Features::from_flags(features),
            allowed_origins: Vec::new(),
            openai_api_key: Some("sk-test".to_string()),
            xai_api_key: None,
        }
    }

    fn test_state(features: &str) -> (AppState, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new());
        let mut llm = LlmService::new("stub-model");
        llm.register(Arc::new(StubProvider));
        let state = AppState::new(
            test_config(features),
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            Arc::new(llm),
        );
        (state, queue)
    }

    fn json_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request builds")
    }

    async fn wait_for_outbox(queue: &MemoryQueue) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let messages = queue.drain_outbox();
            if !messages.is_empty() {
                return messages;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no message reached the task queue"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok_and_issues_session_cookie() {
        let (state, _queue) = test_state("");
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("session cookie issued")
            .to_str()
            .expect("header is ascii");
        assert!(set_cookie.starts_with("MANIMATIC_S="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Secure"));
        assert!(set_cookie.contains("SameSite=Lax"));
    }

    #[tokio::test]
    async fn features_endpoint_reports_flags() {
        let (state, _queue) = test_state("user-compile");
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/features")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body reads");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(value["features"][0]["key"], "user-compile");
        assert_eq!(value["features"][0]["enabled"], true);
    }

    #[tokio::test]
    async fn models_endpoint_lists_registered_models() {
        let (state, _queue) = test_state("");
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/models")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body reads");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(value["models"][0], "stub-model");
        assert_eq!(value["default_model"], "stub-model");
    }

    #[tokio::test]
    async fn generate_rejects_short_prompt() {
        let (state, _queue) = test_state("");
        let response = create_router(state)
            .oneshot(json_request("/generate", r#"{"prompt":"hi"}"#))
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn generate_accepts_and_enqueues_compile_request() {
        let (state, queue) = test_state("");
        let response = create_router(state)
            .oneshot(json_request(
                "/generate",
                r#"{"prompt":"draw a red circle","model":"stub-model"}"#,
            ))
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let messages = wait_for_outbox(&queue).await;
        let envelope = EventEnvelope::decode(&messages[0]).expect("decode task");
        let EventPayload::CompileRequested(task) = envelope.payload else {
            panic!("expected compile_requested, got {}", envelope.kind());
        };
        assert_eq!(task.script, "from manim import *");
        assert!(!envelope.session_id.is_empty());
    }

    #[tokio::test]
    async fn generate_with_invalid_outcome_enqueues_nothing() {
        let (state, queue) = test_state("");
        let response = create_router(state)
            .oneshot(json_request(
                "/generate",
                r#"{"prompt":"something unrelated entirely"}"#,
            ))
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.drain_outbox().is_empty());
    }

    #[tokio::test]
    async fn compile_route_is_feature_gated() {
        let (state, _queue) = test_state("");
        let response = create_router(state)
            .oneshot(json_request("/compile", r#"{"script":"from manim import *"}"#))
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn compile_enqueues_the_submitted_script() {
        let (state, queue) = test_state("user-compile");
        let response = create_router(state)
            .oneshot(json_request("/compile", r#"{"script":"from manim import *"}"#))
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let messages = wait_for_outbox(&queue).await;
        let envelope = EventEnvelope::decode(&messages[0]).expect("decode task");
        assert!(matches!(envelope.payload, EventPayload::CompileRequested(_)));
    }

    #[tokio::test]
    async fn events_stream_has_sse_headers() {
        let (state, _queue) = test_state("");
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .expect("content type set")
            .to_str()
            .expect("ascii header");
        assert!(content_type.starts_with("text/event-stream"));
        assert_eq!(
            response.headers().get(CACHE_CONTROL).expect("cache header"),
            "no-cache"
        );
        assert_eq!(
            response
                .headers()
                .get("x-accel-buffering")
                .expect("buffering header"),
            "no"
        );
    }

    #[test]
    fn llm_service_builds_from_configured_keys() {
        let service = build_llm_service(&test_config(""));
        assert_eq!(service.default_model(), "gpt-4o");
        assert_eq!(
            service.available_models(),
            vec!["gpt-4o", "gpt-4o-mini"]
        );
    }
}
