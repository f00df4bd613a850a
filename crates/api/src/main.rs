//! Rise API Server
//!
//! Serves the billing routes and runs the in-process background task that
//! keeps local memberships in line with Square.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use rise_api::{create_router, AppState, Config};
use rise_billing::BillingService;
use rise_shared::PoolSettings;
use tokio::time::{interval, Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rise_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Rise API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = rise_shared::create_pool(&config.database_url, PoolSettings::API).await?;
    rise_shared::run_migrations(&pool).await?;

    let state = AppState::new(pool, config.clone());

    match &state.billing {
        Some(billing) => {
            tokio::spawn(background_sync_task(
                billing.clone(),
                config.sync_interval_secs,
            ));
            tracing::info!(
                interval_secs = config.sync_interval_secs,
                "Background sync task started"
            );
        }
        None => tracing::warn!("Billing not configured - background sync task not started"),
    }

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Full sync plus duplicate-cache eviction, forever
async fn background_sync_task(billing: Arc<BillingService>, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs.max(60)));

    loop {
        interval.tick().await;

        match billing.sync.run_full_sync().await {
            Ok(summary) => tracing::info!(
                checked = summary.checked,
                fixed = summary.discrepancies_fixed,
                "Scheduled full sync complete"
            ),
            Err(e) => tracing::error!(error = %e, "Scheduled full sync failed"),
        }

        billing.guard.cleanup().await;
    }
}
