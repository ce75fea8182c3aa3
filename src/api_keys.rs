// src/api_keys.rs

use crate::errors::KeyStoreError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::collections::HashSet;
use std::time::Duration;

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn is_valid(&self, key: &str) -> Result<bool, KeyStoreError>;
}

/// Fixed key set from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticApiKeyStore {
    keys: HashSet<String>,
}

impl StaticApiKeyStore {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl ApiKeyStore for StaticApiKeyStore {
    async fn is_valid(&self, key: &str) -> Result<bool, KeyStoreError> {
        if key.is_empty() {
            return Err(KeyStoreError::EmptyKey);
        }
        Ok(self.keys.contains(key))
    }
}

/// Keys stored in Postgres as rows of `(key TEXT, active BOOLEAN)`.
pub struct PgApiKeyStore {
    pool: Pool<Postgres>,
    query: String,
}

impl PgApiKeyStore {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            bail!("invalid api key table name {:?}", table);
        }

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        log::info!("Connected to api key store (table {})", table);

        Ok(Self::from_pool(pool, table))
    }

    pub fn from_pool(pool: Pool<Postgres>, table: &str) -> Self {
        Self {
            pool,
            query: format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE key = $1 AND active = TRUE)",
                table
            ),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn is_valid(&self, key: &str) -> Result<bool, KeyStoreError> {
        if key.is_empty() {
            return Err(KeyStoreError::EmptyKey);
        }
        let exists: bool = sqlx::query_scalar(&self.query)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}
