//! Postgres connection and schema bootstrap.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::jobs::{JobStoreError, PostgresJobStore};
use crate::project_store::{PostgresProjectStore, ProjectStoreError};

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to Postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Projects(#[from] ProjectStoreError),
}

pub async fn connect(database_url: &str) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .map_err(DbError::Connect)
}

/// Create the job and project tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), DbError> {
    PostgresJobStore::new(pool.clone()).ensure_schema().await?;
    PostgresProjectStore::new(pool.clone())
        .ensure_schema()
        .await?;
    info!("database schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_is_a_connect_error() {
        let err = connect("definitely not a url").await.unwrap_err();
        assert!(matches!(err, DbError::Connect(_)));
        assert!(err.to_string().starts_with("failed to connect to Postgres"));
    }
}
