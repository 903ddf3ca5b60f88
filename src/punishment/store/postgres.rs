//! PostgreSQL backend

use crate::config::DatabaseConfig;
use crate::punishment::StoreResult;
use crate::punishment::store::sql::{Dialect, impl_sql_store};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Punishment store shared by all nodes through PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// # Errors
    /// Returns an error if the server cannot be reached
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .application_name(crate::CRATE_NAME);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!(
            host = %config.host,
            database = %config.database,
            "Connected to PostgreSQL punishment store"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl_sql_store!(PostgresStore, "postgres", Dialect::Postgres);
