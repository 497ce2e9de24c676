use crate::alias::ModelAliasResolver;
use crate::config::{UpstreamConfig, env_non_empty};
use crate::error::{AppError, AppResult};
use crate::upstream::UpstreamClient;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::any::Any;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub upstream: UpstreamClient,
    pub aliases: Arc<ModelAliasResolver>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen =
            env_non_empty("OLLAMIZE_LISTEN").unwrap_or_else(|| "0.0.0.0:11434".to_string());
        let metrics_path =
            env_non_empty("OLLAMIZE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
        }
    }
}

pub fn load_state() -> AppResult<AppState> {
    load_state_with_config(RuntimeConfig::from_env(), UpstreamConfig::from_env()?)
}

pub fn load_state_with_config(
    runtime: RuntimeConfig,
    upstream: UpstreamConfig,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("ollamize/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_millis(upstream.timeout_ms))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;
    let aliases = Arc::new(ModelAliasResolver::from_config(&upstream));

    if !upstream.has_api_key() {
        tracing::warn!("no upstream API key configured; backend calls will likely be rejected");
    }
    tracing::info!(
        upstream = %upstream.base_url,
        default_model = %upstream.default_model,
        aliases = aliases.advertised().len(),
        upstream_streaming = upstream.streaming,
        "gateway configured"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        upstream: UpstreamClient::new(http, Arc::new(upstream)),
        aliases,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .merge(build_ollama_router())
        .merge(build_openai_router())
        .route("/", get(crate::catalog::root))
        .route("/health", get(crate::catalog::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_to_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        // later layers wrap earlier ones: the id is set before it is propagated
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
}

fn build_ollama_router() -> Router<AppState> {
    Router::new()
        .route("/api/generate", post(crate::handlers::generate))
        .route("/api/chat", post(crate::handlers::chat))
        .route("/api/tags", get(crate::catalog::tags))
        .route("/api/version", get(crate::catalog::version))
        .route("/api/show", post(crate::catalog::show))
        .route("/api/pull", post(crate::catalog::pull))
        .route("/api/copy", post(crate::catalog::copy))
        .route("/api/delete", delete(crate::catalog::delete))
}

fn build_openai_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .route("/chat/completions", post(crate::handlers::chat_completions))
        .route("/v1/models", get(crate::catalog::list_models))
}

fn panic_to_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    AppError::internal(format!("internal error: {detail}")).into_response()
}
