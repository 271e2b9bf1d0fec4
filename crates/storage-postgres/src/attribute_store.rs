//! PostgreSQL-backed attribute storage.
//!
//! Attributes are slowly-changing descriptive columns, kept in one
//! unpartitioned table keyed (entity, timestamp) and always written through
//! the staged update-merge path. The previous version of every overwritten
//! row is kept in a schema-stable jsonb history companion, so attribute
//! columns can evolve without history migrations.

use sqlx::postgres::PgPool;
use trendbase_core::{
    AttributeStore, DataPackage, EntityDirectory, PlanReport, RefinedPackage, StorageResult,
};

use crate::error::classify;
use crate::trend_store::{quote_ident, PostgresTrendStorage};

/// An attribute store bound to a PostgreSQL session.
pub struct PostgresAttributeStore {
    storage: PostgresTrendStorage,
    /// The attribute store definition this instance writes to
    pub definition: AttributeStore,
}

impl PostgresAttributeStore {
    /// Bind an attribute store definition to a pool.
    pub fn new(pool: PgPool, definition: AttributeStore) -> PostgresAttributeStore {
        PostgresAttributeStore {
            storage: PostgresTrendStorage::new(pool),
            definition,
        }
    }

    /// Create the backing table and its history companion if missing.
    /// Unlike trend partitions these are not self-healed on write; call this
    /// once when the store definition is registered.
    pub async fn ensure_tables(&self) -> StorageResult<()> {
        let mut columns = String::from(
            "entity_id bigint NOT NULL, \"timestamp\" timestamptz NOT NULL, \
             modified timestamptz NOT NULL, job_id bigint NOT NULL",
        );
        for attribute in &self.definition.attributes {
            columns.push_str(&format!(
                ", {} {}",
                quote_ident(&attribute.name),
                attribute.data_type.sql_type()
            ));
        }
        let base = format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns}, PRIMARY KEY (entity_id, \"timestamp\"))",
            quote_ident(&self.definition.table_name())
        );
        sqlx::query(&base)
            .execute(self.storage.pool())
            .await
            .map_err(classify)?;

        let history = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                entity_id bigint NOT NULL,
                \"timestamp\" timestamptz NOT NULL,
                modified timestamptz NOT NULL,
                archived timestamptz NOT NULL DEFAULT now(),
                \"values\" jsonb NOT NULL
            )",
            quote_ident(&self.definition.history_table_name())
        );
        sqlx::query(&history)
            .execute(self.storage.pool())
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Store a refined package of attribute values.
    pub async fn store(
        &mut self,
        package: &RefinedPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport> {
        self.definition
            .store(&mut self.storage, package, job_id)
            .await
    }

    /// Resolve entity references through the directory, then store.
    pub async fn store_raw<D>(
        &mut self,
        directory: &D,
        package: &DataPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport>
    where
        D: EntityDirectory + ?Sized,
    {
        let refined = package.refine(directory).await?;
        self.store(&refined, job_id).await
    }
}
