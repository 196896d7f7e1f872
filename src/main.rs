//! Catalog Backend
//!
//! REST backend for the shop catalog: collections, products, tag-based
//! collection matching, linked collections and product counts, on SQLite.

mod api;
mod auth;
mod catalog;
mod config;
mod db;
mod errors;
mod models;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use catalog::DeleteGuard;
use config::{Config, LogFormat};
use db::Repository;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Arc<Config>,
    pub delete_guard: Arc<DeleteGuard>,
}

impl AppState {
    pub fn new(repo: Repository, config: Config) -> Self {
        let delete_guard = DeleteGuard::new(config.delete_confirm_window);
        Self {
            repo: Arc::new(repo),
            config: Arc::new(config),
            delete_guard: Arc::new(delete_guard),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting Catalog Backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);
    tracing::info!(
        tag_case = ?config.tag_case,
        delete_confirm_ms = config.delete_confirm_window.as_millis() as u64,
        "Catalog policy"
    );

    if config.api_psk.is_none() {
        tracing::warn!("No admin key configured (CATALOG_API_PSK). Admin routes are open!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Repository::new(pool, config.tag_case);

    let bind_addr = config.bind_addr;
    let state = AppState::new(repo, config);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let psk = state.config.api_psk.clone();

    let api_routes = Router::new()
        .route("/revision", get(api::get_revision))
        // Collections
        .route(
            "/collections",
            get(api::list_collections).post(api::create_collection),
        )
        .route("/collections/counts", get(api::collection_product_counts))
        .route(
            "/collections/{id}",
            get(api::get_collection)
                .put(api::update_collection)
                .delete(api::delete_collection),
        )
        .route("/collections/{id}/tags", post(api::add_collection_tag))
        // Membership
        .route(
            "/collections/{id}/products",
            get(api::list_collection_products),
        )
        .route(
            "/collections/{id}/products/count",
            get(api::count_collection_products),
        )
        .route(
            "/collections/{id}/products/{product_id}",
            put(api::add_collection_product).delete(api::remove_collection_product),
        )
        // Linked collections
        .route("/collections/{id}/links", get(api::list_links))
        .route("/collections/{id}/links/commit", post(api::commit_links))
        // Products
        .route(
            "/products",
            get(api::list_products).post(api::create_product),
        )
        .route(
            "/products/{id}",
            get(api::get_product)
                .put(api::update_product)
                .delete(api::delete_product),
        )
        .route(
            "/products/{id}/matching-collections",
            get(api::matching_collections),
        )
        // Mutations require the admin key
        .layer(middleware::from_fn(move |req, next| {
            auth::admin_auth_layer(psk.clone(), req, next)
        }));

    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
