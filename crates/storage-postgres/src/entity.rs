//! Entity directory backed by the `entity` registry table.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use trendbase_core::{EntityDirectory, StorageError, StorageResult};

use crate::error::classify;

/// Name-to-id resolution with an in-process cache. Ids are stable, so cache
/// entries never invalidate.
pub struct PostgresEntityDirectory {
    pool: PgPool,
    cache: RwLock<HashMap<String, i64>>,
}

impl PostgresEntityDirectory {
    /// A directory on the given pool.
    pub fn new(pool: PgPool) -> PostgresEntityDirectory {
        PostgresEntityDirectory {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register an entity, returning its id. Safe against concurrent
    /// registration of the same name. The write path never calls this;
    /// resolution failures there are hard errors by design.
    pub async fn register(&self, name: &str) -> StorageResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO entity (name) VALUES ($1)
               ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
               RETURNING id"#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        self.cache.write().await.insert(name.to_string(), id);
        Ok(id)
    }
}

#[async_trait]
impl EntityDirectory for PostgresEntityDirectory {
    async fn resolve(&self, name: &str) -> StorageResult<i64> {
        if let Some(id) = self.cache.read().await.get(name) {
            return Ok(*id);
        }
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM entity WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        match id {
            Some(id) => {
                self.cache.write().await.insert(name.to_string(), id);
                Ok(id)
            }
            None => Err(StorageError::EntityResolution(name.to_string())),
        }
    }
}
