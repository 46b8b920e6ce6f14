//! REST task service: accounts, per-user task storage, document upload and
//! statistics, served with axum.

pub mod auth;
pub mod config;
pub mod convert;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod state;
pub mod storage;
pub mod validation;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{
        HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
    routing::{get, post, put},
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{MAX_UPLOAD_BYTES, RATE_LIMIT_WINDOW, ServerConfig};
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

/// Room for the multipart framing around a maximum-size file, so the handler
/// can answer an oversized upload with 400 itself.
const UPLOAD_BODY_LIMIT: usize = MAX_UPLOAD_BYTES + 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let auth_limiter = Arc::new(RateLimiter::new(
        "auth",
        state.config.auth_rate_limit,
        RATE_LIMIT_WINDOW,
    ));
    let api_limiter = Arc::new(RateLimiter::new(
        "api",
        state.config.api_rate_limit,
        RATE_LIMIT_WINDOW,
    ));

    let public = Router::new()
        .route("/api/register", post(handlers::register))
        .route("/api/login", post(handlers::login))
        .route_layer(middleware::from_fn_with_state(
            auth_limiter,
            rate_limit::enforce,
        ));

    let protected = Router::new()
        .route(
            "/api/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route("/api/tasks/search", get(handlers::search_tasks))
        .route("/api/tasks/bulk", post(handlers::create_tasks_bulk))
        .route(
            "/api/tasks/{id}",
            put(handlers::update_task).delete(handlers::delete_task),
        )
        .route("/api/stats", get(handlers::stats))
        .route(
            "/api/upload",
            post(handlers::upload).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            api_limiter,
            rate_limit::enforce,
        ))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%origin, error = %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

pub fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

#[tracing::instrument(skip_all, fields(addr = %config.socket_addr()))]
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let addr = config.socket_addr();
    let state = Arc::new(AppState::open(config)?);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    serve_on(listener, state, shutdown_signal()).await
}

/// Serves until `shutdown` resolves; lets callers pick the listener, which
/// is how the integration tests get an ephemeral port.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no address")?;
    info!(%addr, data_dir = %state.config.data_dir.display(), "docket server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server terminated with an error")?;

    info!("docket server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
