//! Job status persistence. Two interchangeable backends, picked at deploy time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{AppConfig, RepositoryBackend};
use crate::models::audit::DeletionAuditRecord;
use crate::models::job::{ImageJob, JobUpdate};

pub mod postgres;
pub mod redis_store;

pub use postgres::PgJobRepository;
pub use redis_store::RedisJobRepository;

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, RepositoryError>;

    /// Apply a status update. Returns `false`, without creating anything, when
    /// the job does not exist or is already terminal.
    async fn update_job_status(
        &self,
        update: &JobUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn append_deletion_audit(&self, record: &DeletionAuditRecord) -> Result<(), RepositoryError>;

    async fn close(&self) -> Result<(), RepositoryError>;
}

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Build the backend selected in configuration.
pub async fn connect_repository(
    config: &AppConfig,
    redis: &redis::Client,
) -> Result<Arc<dyn JobRepository>, RepositoryError> {
    match config.job_repository_backend {
        RepositoryBackend::Redis => {
            let conn = redis.get_multiplexed_async_connection().await?;
            Ok(Arc::new(RedisJobRepository::new(conn)))
        }
        RepositoryBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| RepositoryError::Corrupt("database_url is not set".to_string()))?;
            let pool = init_pool(url).await?;
            Ok(Arc::new(PgJobRepository::new(pool)))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt job record: {0}")]
    Corrupt(String),

    #[error("repository is closed")]
    Closed,
}
