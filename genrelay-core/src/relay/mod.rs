//! The relay endpoint: authenticated HTTP front for the providers.

pub mod error;
pub mod handlers;
pub mod session;

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use axum::body::Body;
use axum::http::Request;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::{Level, Span};

use crate::auth::{TokenVerifier, verifier_from_config};
use crate::config::Config;
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::provider_factory::ProviderRegistry;
use crate::router::RoutingResolver;
use crate::validate::RequestLimits;

pub use session::{StreamPolicy, StreamSession, session_events};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub router: Arc<RoutingResolver>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub limits: RequestLimits,
    pub policy: StreamPolicy,
    /// Parent of every session token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let registry = ProviderRegistry::from_config(cfg)?;
        let router = RoutingResolver::new(cfg)?;
        let verifier = verifier_from_config(&cfg.auth, &HttpClient::from_cfg(&cfg.http)?)?;
        Ok(Self {
            registry: Arc::new(registry),
            router: Arc::new(router),
            verifier,
            limits: RequestLimits {
                max_prompt_chars: cfg.server.max_prompt_chars,
            },
            policy: StreamPolicy::from_cfg(&cfg.server),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Per-request span. Handlers fill in the provider and caller once known.
fn request_span(req: &Request<Body>) -> Span {
    tracing::info_span!(
        "relay.request",
        method = %req.method(),
        uri = %req.uri(),
        llm.provider = tracing::field::Empty,
        auth.subject = tracing::field::Empty,
    )
}

/// Create the relay router with all routes.
///
/// Error statuses are logged by the `IntoResponse` impl for `GenRelayError`,
/// so the trace layer reports them at debug only.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(handlers::generate))
        .route("/stream", post(handlers::stream))
        .route("/health", get(handlers::health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_failure(DefaultOnFailure::new().level(Level::DEBUG)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `signal` resolves. Live streams are cancelled first, so
/// each ends with its terminal event before the connections drain.
pub async fn run_server<F>(state: AppState, bind: &str, signal: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = state.shutdown.clone();
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "relay listening");

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            tracing::info!("shutdown requested, cancelling live streams");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

/// Resolves on ctrl-c.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
