//! HTTP server implementation using Axum.

use axum::{
    Router,
    extract::State,
    routing::{delete, get, put},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use switchgrid_core::config::GatewayConfig;
use switchgrid_registry::Registry;
use switchgrid_store::KvStore;

/// Shared state for the gateway server.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<KvStore>,
    /// Expected Authorization header value. Empty disables auth.
    pub api_key: String,
}

/// Authorization middleware. Compares the Authorization header against the
/// configured API key; peers send the key verbatim.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if state.api_key.is_empty() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented == state.api_key {
        return next.run(req).await;
    }

    axum::response::Response::builder()
        .status(axum::http::StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(
            serde_json::json!({"status": 401, "message": "unauthorized"}).to_string(),
        ))
        .unwrap()
}

/// Build the Axum router with all routes.
pub fn build_router(shared: Arc<AppState>) -> Router {
    // Protected routes — require the API key
    let protected = Router::new()
        .route("/api/controllers", get(super::routes::list_controllers))
        .route("/api/controllers/{id}", get(super::routes::get_controller))
        .route("/api/controllers/{id}", put(super::routes::update_controller))
        .route("/api/store/keys", get(super::routes::list_keys))
        .route("/api/store/keys/{*key}", get(super::routes::get_key))
        .route("/api/store/keys/{*key}", put(super::routes::set_key))
        .route("/api/store/keys/{*key}", delete(super::routes::delete_key))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_api_key,
        ));

    // Public routes — no auth
    let public = Router::new().route("/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server. Runs until the listener fails.
pub async fn start(
    config: &GatewayConfig,
    registry: Arc<Registry>,
    store: Arc<KvStore>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        registry,
        store,
        api_key: config.api_key.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
