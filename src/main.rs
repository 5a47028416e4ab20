mod config;
mod db;
mod errors;
mod llm;
mod payments;
mod pdf;
mod routes;
mod state;
mod workflow;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resumeflame=info,tower_http=info".into()),
        )
        .init();

    let config = config::Config::from_env()?;
    let config = Arc::new(config);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(pool.as_ref()).await?;

    let llm = llm::GenerationClient::new(config.claude_api_key.clone());
    tracing::info!("Generation client initialized (model: {})", llm::MODEL);

    let state = Arc::new(state::AppState {
        pool,
        config: config.clone(),
        llm,
    });

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/api/upload", post(routes::upload))
        .route("/api/confirm-payment", post(routes::confirm_payment))
        .route("/api/submissions/:submission_id", get(routes::get_submission))
        .route("/api/webhook", post(routes::payment_webhook))
        .route("/api/cleanup", post(routes::cleanup))
        // Multipart overhead on top of the 5MB file cap.
        .layer(DefaultBodyLimit::max(routes::MAX_UPLOAD_BYTES + 64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("ResumeFlame listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
