mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod membership;
mod messaging;
mod metrics;
mod registry;
mod store;
mod validation;
mod ws;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::{identity::IdentityResolver, jwt::JwtAccessTokenService},
    config::{GatewayConfig, LogFormat},
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::GatewayMetrics,
    registry::ConversationRegistry,
    store::ChatStore,
    validation::MAX_REST_BODY_BYTES,
    ws::HeartbeatConfig,
};

/// Longer than a session's bounded close-frame write.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared handles every surface (socket and REST) is built from.
#[derive(Clone)]
pub struct GatewayServices {
    pub store: ChatStore,
    pub registry: ConversationRegistry,
    pub resolver: IdentityResolver,
    pub metrics: Arc<GatewayMetrics>,
    pub heartbeat: HeartbeatConfig,
}

impl GatewayServices {
    pub fn new(store: ChatStore, jwt_service: Arc<JwtAccessTokenService>) -> Self {
        Self {
            resolver: IdentityResolver::new(jwt_service, store.clone()),
            store,
            registry: ConversationRegistry::default(),
            metrics: Arc::new(GatewayMetrics::default()),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    init_tracing(&config)?;

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set CARECHAT_GATEWAY_JWT_SECRET in production");
    }
    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid gateway JWT secret")?,
    );

    let database_url = config
        .database_url
        .as_deref()
        .context("CARECHAT_GATEWAY_DATABASE_URL must be set")?;
    let pool = create_pg_pool(database_url, config.pool.clone())
        .await
        .context("failed to initialize gateway PostgreSQL pool")?;
    check_pool_health(&pool).await.context("gateway PostgreSQL health check failed")?;
    run_migrations(&pool).await.context("failed to apply gateway migrations")?;

    let services = GatewayServices::new(ChatStore::Postgres(pool), jwt_service);
    metrics::set_global_metrics(Arc::clone(&services.metrics));
    let registry = services.registry.clone();
    let app = build_router(&services, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting chat gateway");

    let shutdown_registry = registry.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let live_sessions = shutdown_registry.session_count();
            let signalled = shutdown_registry.close_all();
            info!(live_sessions, signalled, "closing live chat sessions");
        })
        .await
        .context("gateway server exited unexpectedly");

    // Upgraded sockets outlive `serve`; keep the runtime up until they say goodbye.
    if registry.wait_until_empty(SESSION_DRAIN_TIMEOUT).await {
        info!("all chat sessions closed");
    } else {
        warn!(remaining = registry.session_count(), "chat sessions still open at shutdown");
    }

    served
}

fn init_tracing(config: &GatewayConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter '{}'", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain => builder.try_init(),
    }
    .map_err(|error| anyhow::anyhow!(error))
    .context("failed to install tracing subscriber")
}

fn build_router(services: &GatewayServices, cors_origins: Option<&str>) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(Arc::clone(&services.metrics));

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(metrics_router)
            .merge(ws::router(ws::ChatSocketState::new(services)))
            .merge(api::router(services)),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<GatewayMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render_prometheus(),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
