//! MySQL and MariaDB backend

use crate::config::DatabaseConfig;
use crate::punishment::StoreResult;
use crate::punishment::store::sql::{Dialect, impl_sql_store};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::info;

/// Punishment store shared by all nodes through MySQL
#[derive(Debug, Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// # Errors
    /// Returns an error if the server cannot be reached
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .charset("utf8mb4");
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!(
            host = %config.host,
            database = %config.database,
            "Connected to MySQL punishment store"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

impl_sql_store!(MySqlStore, "mysql", Dialect::MySql);
