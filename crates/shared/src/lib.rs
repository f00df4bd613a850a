//! Shared infrastructure for the Rise services
//!
//! Database pool creation and schema migrations used by both the API and the
//! worker.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,

    #[error("Database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Pool sizing for one process
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub const API: PoolSettings = PoolSettings {
        max_connections: 10,
        acquire_timeout: Duration::from_secs(5),
    };

    pub const WORKER: PoolSettings = PoolSettings {
        max_connections: 5,
        acquire_timeout: Duration::from_secs(5),
    };
}

pub fn database_url() -> Result<String, SharedError> {
    std::env::var("DATABASE_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .ok_or(SharedError::MissingDatabaseUrl)
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str, settings: PoolSettings) -> Result<PgPool, SharedError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        "Database pool created"
    );
    Ok(pool)
}

/// Apply pending migrations for the tables this service owns
pub async fn run_migrations(pool: &PgPool) -> Result<(), SharedError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
