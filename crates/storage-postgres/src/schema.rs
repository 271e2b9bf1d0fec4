//! Registry schema: the metadata tables the storage layer itself needs.
//!
//! Trend partitions and attribute tables are created lazily by the write
//! engine; the registry tables here are bootstrapped once per database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use trendbase_core::{Granularity, StorageResult, TrendStore, TrendStorePart};
use uuid::Uuid;

use crate::error::classify;

/// Bootstrap DDL, executed in order; every statement is idempotent.
pub const BOOTSTRAP_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS trend_store (
        id uuid PRIMARY KEY,
        entity_type text NOT NULL,
        data_source text NOT NULL,
        granularity_seconds bigint NOT NULL,
        partition_size_seconds bigint NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        UNIQUE (entity_type, data_source, granularity_seconds)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trend_store_part (
        id uuid PRIMARY KEY,
        store_id uuid NOT NULL REFERENCES trend_store (id),
        name text NOT NULL UNIQUE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS attribute_store (
        id uuid PRIMARY KEY,
        entity_type text NOT NULL,
        data_source text NOT NULL,
        UNIQUE (entity_type, data_source)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS entity (
        id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        name text NOT NULL UNIQUE,
        created_at timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS modified_log (
        table_name text NOT NULL,
        "timestamp" timestamptz NOT NULL,
        modified timestamptz NOT NULL,
        PRIMARY KEY (table_name, "timestamp")
    )"#,
    r#"CREATE TABLE IF NOT EXISTS materialization_state (
        materialization text NOT NULL,
        "timestamp" timestamptz NOT NULL,
        fingerprint text NOT NULL,
        materialized timestamptz NOT NULL DEFAULT now(),
        PRIMARY KEY (materialization, "timestamp")
    )"#,
];

/// Create the registry tables if they do not exist yet.
pub async fn bootstrap(pool: &PgPool) -> StorageResult<()> {
    for statement in BOOTSTRAP_DDL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(classify)?;
    }
    Ok(())
}

/// A row of the `trend_store` registry table.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct TrendStoreRow {
    /// Store identifier
    pub id: Uuid,
    /// Entity type whose counters this store holds
    pub entity_type: String,
    /// Producing data source
    pub data_source: String,
    /// Sampling interval in seconds
    pub granularity_seconds: i64,
    /// Partition size in seconds
    pub partition_size_seconds: i64,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
}

/// A row of the `trend_store_part` registry table.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct TrendStorePartRow {
    /// Part identifier
    pub id: Uuid,
    /// Owning store
    pub store_id: Uuid,
    /// Base table name
    pub name: String,
}

/// A row of the `modified_log` table.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct ModifiedLogRow {
    /// Bucket table name
    pub table_name: String,
    /// Bucket timestamp
    pub timestamp: DateTime<Utc>,
    /// Latest write timestamp observed for the bucket
    pub modified: DateTime<Utc>,
}

/// A row of the `materialization_state` table.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct MaterializationStateRow {
    /// Materialization name
    pub materialization: String,
    /// Output time bucket
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the contributing source marks at materialization time
    pub fingerprint: String,
    /// When the output was last written
    pub materialized: DateTime<Utc>,
}

/// Register a trend store and its parts, returning the stored definition.
/// Already-registered stores and parts are left as they are.
pub async fn register_trend_store(
    pool: &PgPool,
    entity_type: &str,
    data_source: &str,
    granularity: Granularity,
    partition_size_seconds: i64,
    part_names: &[&str],
) -> StorageResult<TrendStore> {
    let store_id: Uuid = sqlx::query_scalar(
        r#"INSERT INTO trend_store (id, entity_type, data_source, granularity_seconds, partition_size_seconds)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (entity_type, data_source, granularity_seconds)
           DO UPDATE SET partition_size_seconds = trend_store.partition_size_seconds
           RETURNING id"#,
    )
    .bind(Uuid::new_v4())
    .bind(entity_type)
    .bind(data_source)
    .bind(granularity.as_seconds())
    .bind(partition_size_seconds)
    .fetch_one(pool)
    .await
    .map_err(classify)?;

    let mut parts = Vec::with_capacity(part_names.len());
    for name in part_names {
        let part_id: Uuid = sqlx::query_scalar(
            r#"INSERT INTO trend_store_part (id, store_id, name)
               VALUES ($1, $2, $3)
               ON CONFLICT (name) DO UPDATE SET store_id = EXCLUDED.store_id
               RETURNING id"#,
        )
        .bind(Uuid::new_v4())
        .bind(store_id)
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(classify)?;
        parts.push(TrendStorePart {
            id: part_id,
            name: name.to_string(),
            trends: Vec::new(),
        });
    }

    Ok(TrendStore {
        id: store_id,
        entity_type: entity_type.to_string(),
        data_source: data_source.to_string(),
        granularity,
        partition_size: partition_size_seconds,
        parts,
    })
}
