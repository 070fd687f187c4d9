//! Database connection pool management, grounded in the source's
//! `DatabasePoolInterface`/`DatabasePool` shaku component.

use async_trait::async_trait;
use milvaion_config::DatabaseConfig;
use milvaion_core::{MilvaionError, MilvaionResult};
use shaku::{Component, Interface};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::sync::Arc;
use tracing::{info, warn};

/// Abstracts pool lifecycle so components can depend on a trait object
/// instead of a concrete `sqlx::MySqlPool`.
#[async_trait]
pub trait DatabasePoolInterface: Interface + Send + Sync {
    fn inner(&self) -> &MySqlPool;
    async fn health_check(&self) -> MilvaionResult<()>;
    async fn run_migrations(&self) -> MilvaionResult<()>;
    async fn close(&self);
}

/// Connection pool wrapper around `sqlx::MySqlPool`.
#[derive(Component)]
#[shaku(interface = DatabasePoolInterface)]
pub struct DatabasePool {
    pool: MySqlPool,
}

impl DatabasePool {
    /// Opens a new pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> MilvaionResult<Self> {
        info!("connecting to MySQL");
        let pool = MySqlPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to connect to MySQL");
                MilvaionError::Store(format!("connect failed: {e}"))
            })?;
        info!("MySQL connection pool established");
        Ok(Self { pool })
    }

    /// Wraps a pre-existing pool (used by tests and by the shaku module).
    #[must_use]
    pub const fn with_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn inner(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl DatabasePoolInterface for DatabasePool {
    fn inner(&self) -> &MySqlPool {
        &self.pool
    }

    async fn health_check(&self) -> MilvaionResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MilvaionError::Store(format!("health check failed: {e}")))?;
        Ok(())
    }

    async fn run_migrations(&self) -> MilvaionResult<()> {
        info!("running database migrations");
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MilvaionError::Store(format!("migration failed: {e}")))?;
        info!("database migrations complete");
        Ok(())
    }

    async fn close(&self) {
        info!("closing MySQL connection pool");
        self.pool.close().await;
    }
}

impl std::ops::Deref for DatabasePool {
    type Target = MySqlPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

/// Creates a shared database pool for the server binary to wire into
/// `MySqlStore`.
pub async fn create_pool(config: &DatabaseConfig) -> MilvaionResult<Arc<DatabasePool>> {
    let pool = DatabasePool::connect(config).await?;
    Ok(Arc::new(pool))
}
