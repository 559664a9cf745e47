use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consig_flow_api::batch::BatchRunner;
use consig_flow_api::cache::OfferCache;
use consig_flow_api::config::Config;
use consig_flow_api::flow::FlowEngine;
use consig_flow_api::handlers::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consig_flow_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Approved-offer cache, flat file rewritten in full on each mutation
    let cache = Arc::new(OfferCache::new(config.cache_file.clone()));
    tracing::info!("Offer cache backed by {}", config.cache_file.display());

    // Flow coordinator owns the token cache, provider and CRM clients
    let engine = Arc::new(FlowEngine::new(config.clone(), cache.clone()));
    tracing::info!("Flow engine initialized");

    let batch = BatchRunner::new(engine.clone(), config.batch_fan_out);

    let app_state = Arc::new(AppState {
        config: config.clone(),
        engine,
        cache,
        batch,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Flow endpoints
        .route("/flow/run", post(handlers::run_flow))
        .route("/crm/sync", post(handlers::sync_crm))
        // Approved-offer cache endpoints
        .route(
            "/cache",
            get(handlers::list_cached_offers).post(handlers::save_cached_offer),
        )
        .route(
            "/cache/:cpf",
            get(handlers::get_cached_offer)
                .put(handlers::update_cached_offer)
                .delete(handlers::delete_cached_offer),
        )
        // Batch endpoints
        .route("/batch/run", post(handlers::start_batch))
        .route("/batch/pause", post(handlers::pause_batch))
        .route("/batch/resume", post(handlers::resume_batch))
        .route("/batch/status", get(handlers::batch_status))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 2MB max payload
                .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
