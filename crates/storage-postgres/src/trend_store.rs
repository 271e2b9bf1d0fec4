//! PostgreSQL-backed trend storage.
//!
//! [`PostgresTrendStorage`] implements the store session the write engine
//! drives: bulk `COPY` transfer, multi-row inserts, staged update-merge,
//! and the idempotent corrective DDL the engine splices in when a write
//! trips over a schema gap.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolCopyExt};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, warn};
use trendbase_core::{
    ColumnDescriptor, DataPackage, DataType, EntityDirectory, ParserConfig, Partition,
    Partitioning, PlanReport, RefinedPackage, StorageError, StorageResult, TrendStorage,
    TrendStorePart, Value, WriteBatch,
};

use crate::error::{classify, tolerate_existing, DUPLICATE_COLUMN, DUPLICATE_TABLE};

/// One row read back from a partition scan.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievedRow {
    /// Entity id
    pub entity_id: i64,
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Values in requested column order, rendered as text; `None` is NULL
    pub values: Vec<Option<String>>,
}

/// A store session against PostgreSQL.
#[derive(Clone)]
pub struct PostgresTrendStorage {
    pool: PgPool,
    parser_config: ParserConfig,
}

impl PostgresTrendStorage {
    /// A session on the given pool.
    pub fn new(pool: PgPool) -> PostgresTrendStorage {
        PostgresTrendStorage {
            pool,
            parser_config: ParserConfig::default(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn copy_payload(&self, batch: &WriteBatch) -> StorageResult<String> {
        let mut payload = String::new();
        for row in &batch.rows {
            payload.push_str(&row.entity_id.to_string());
            payload.push('\t');
            payload.push_str(&format_pg_timestamp(row.timestamp));
            payload.push('\t');
            payload.push_str(&format_pg_timestamp(batch.modified));
            payload.push('\t');
            payload.push_str(&batch.job_id.to_string());
            for (column, literal) in batch.columns.iter().zip(&row.values) {
                payload.push('\t');
                let value = column.data_type.parse(&self.parser_config, literal)?;
                match value {
                    Value::Null => payload.push_str("\\N"),
                    other => payload.push_str(&escape_copy(&column.data_type.serialize(&other))),
                }
            }
            payload.push('\n');
        }
        Ok(payload)
    }
}

#[async_trait]
impl TrendStorage for PostgresTrendStorage {
    async fn copy_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64> {
        // Serialize before opening the stream so a bad literal fails the
        // whole batch without a half-sent COPY.
        let payload = self.copy_payload(batch)?;
        let mut columns = vec![
            "entity_id".to_string(),
            "\"timestamp\"".to_string(),
            "modified".to_string(),
            "job_id".to_string(),
        ];
        columns.extend(batch.columns.iter().map(|c| quote_ident(&c.name)));
        let statement = format!(
            "COPY {} ({}) FROM STDIN",
            quote_ident(&batch.table),
            columns.join(", ")
        );

        let mut copy = self.pool.copy_in_raw(&statement).await.map_err(classify)?;
        if let Err(error) = copy.send(payload.as_bytes()).await {
            return Err(classify(error));
        }
        copy.finish().await.map_err(classify)
    }

    async fn insert_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64> {
        if batch.rows.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (entity_id, \"timestamp\", modified, job_id",
            quote_ident(&batch.table)
        ));
        for column in &batch.columns {
            builder.push(", ");
            builder.push(quote_ident(&column.name));
        }
        builder.push(") ");

        // Parse and re-serialize each literal with its deduced type before
        // binding, exactly like the COPY path, so both write paths accept
        // the same literals and a bad one fails the batch up front.
        let mut serialized: Vec<Vec<Option<String>>> = Vec::with_capacity(batch.rows.len());
        for row in &batch.rows {
            let mut fields = Vec::with_capacity(batch.columns.len());
            for (column, literal) in batch.columns.iter().zip(&row.values) {
                let value = column.data_type.parse(&self.parser_config, literal)?;
                fields.push(match value {
                    Value::Null => None,
                    other => Some(column.data_type.serialize(&other)),
                });
            }
            serialized.push(fields);
        }

        builder.push_values(batch.rows.iter().zip(serialized), |mut values, (row, fields)| {
            values.push_bind(row.entity_id);
            values.push_bind(row.timestamp);
            values.push_bind(batch.modified);
            values.push_bind(batch.job_id);
            for (column, field) in batch.columns.iter().zip(fields) {
                values.push_bind(field);
                values.push_unseparated(format!("::{}", column.data_type.sql_type()));
            }
        });

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn update_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64> {
        let payload = self.copy_payload(batch)?;
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Stage the batch into a session-local table typed with the deduced
        // column types; the server parses literals on the way in.
        let mut staging_columns = String::from(
            "entity_id bigint NOT NULL, \"timestamp\" timestamptz NOT NULL, \
             modified timestamptz NOT NULL, job_id bigint NOT NULL",
        );
        for column in &batch.columns {
            staging_columns.push_str(&format!(
                ", {} {}",
                quote_ident(&column.name),
                column.data_type.sql_type()
            ));
        }
        sqlx::query(&format!(
            "CREATE TEMPORARY TABLE staging_batch ({staging_columns}) ON COMMIT DROP"
        ))
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let mut copy_columns = vec![
            "entity_id".to_string(),
            "\"timestamp\"".to_string(),
            "modified".to_string(),
            "job_id".to_string(),
        ];
        copy_columns.extend(batch.columns.iter().map(|c| quote_ident(&c.name)));
        let copy_statement = format!(
            "COPY staging_batch ({}) FROM STDIN",
            copy_columns.join(", ")
        );
        let mut copy = (&mut *tx).copy_in_raw(&copy_statement).await.map_err(classify)?;
        if let Err(error) = copy.send(payload.as_bytes()).await {
            return Err(classify(error));
        }
        copy.finish().await.map_err(classify)?;

        // Keep the previous row versions before overwriting, when asked to.
        if let Some(history_table) = &batch.history_table {
            let history = format!(
                "INSERT INTO {} (entity_id, \"timestamp\", modified, \"values\")
                 SELECT t.entity_id, t.\"timestamp\", t.modified,
                        to_jsonb(t) - 'entity_id' - 'timestamp' - 'modified' - 'job_id'
                 FROM {} t
                 JOIN staging_batch s USING (entity_id, \"timestamp\")",
                quote_ident(history_table),
                quote_ident(&batch.table)
            );
            sqlx::query(&history)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }

        // Overwrite existing keys, keeping the modification mark monotonic.
        let assignments: Vec<String> = batch
            .columns
            .iter()
            .map(|c| format!("{0} = s.{0}", quote_ident(&c.name)))
            .collect();
        let update = format!(
            "UPDATE {target} t
             SET modified = GREATEST(t.modified, s.modified), job_id = s.job_id{separator}{assignments}
             FROM staging_batch s
             WHERE t.entity_id = s.entity_id AND t.\"timestamp\" = s.\"timestamp\"",
            target = quote_ident(&batch.table),
            separator = if assignments.is_empty() { "" } else { ", " },
            assignments = assignments.join(", "),
        );
        let updated = sqlx::query(&update)
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();

        // Insert only the keys the target does not have yet.
        let insert = format!(
            "INSERT INTO {target} ({columns})
             SELECT {selected}
             FROM staging_batch s
             WHERE NOT EXISTS (
                 SELECT 1 FROM {target} t
                 WHERE t.entity_id = s.entity_id AND t.\"timestamp\" = s.\"timestamp\"
             )",
            target = quote_ident(&batch.table),
            columns = copy_columns.join(", "),
            selected = copy_columns
                .iter()
                .map(|c| format!("s.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        );
        let inserted = sqlx::query(&insert)
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();

        tx.commit().await.map_err(classify)?;
        Ok(updated + inserted)
    }

    async fn create_partition(
        &mut self,
        table: &str,
        partition: &Partition,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()> {
        let mut ddl = format!(
            "CREATE TABLE {} (\n    entity_id bigint NOT NULL,\n    \"timestamp\" timestamptz NOT NULL,\n    modified timestamptz NOT NULL,\n    job_id bigint NOT NULL",
            quote_ident(table)
        );
        for column in columns {
            ddl.push_str(&format!(
                ",\n    {} {}",
                quote_ident(&column.name),
                column.data_type.sql_type()
            ));
        }
        ddl.push_str(&format!(
            ",\n    PRIMARY KEY (entity_id, \"timestamp\"),\n    CHECK (\"timestamp\" >= '{}' AND \"timestamp\" < '{}')\n)",
            format_pg_timestamp(partition.start),
            format_pg_timestamp(partition.end)
        ));

        debug!(table, index = partition.index, "creating partition table");
        let result = sqlx::query(&ddl).execute(&self.pool).await.map(|_| ());
        tolerate_existing(result, &[DUPLICATE_TABLE])
    }

    async fn ensure_columns(
        &mut self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()> {
        for column in columns {
            let ddl = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(&column.name),
                column.data_type.sql_type()
            );
            let result = sqlx::query(&ddl).execute(&self.pool).await.map(|_| ());
            // A column another writer added first is as good as ours.
            tolerate_existing(result, &[DUPLICATE_COLUMN])?;
        }
        Ok(())
    }

    async fn ensure_column_types(
        &mut self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()> {
        let current: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name, udt_name FROM information_schema.columns WHERE table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        for column in columns {
            let Some((_, udt_name)) = current.iter().find(|(name, _)| name == &column.name)
            else {
                continue;
            };
            let Some(current_type) = DataType::from_pg_name(udt_name) else {
                warn!(table, column = %column.name, udt = %udt_name, "column type outside the registry, not widening");
                continue;
            };
            let wanted = trendbase_core::max_data_type(current_type, column.data_type);
            if wanted == current_type {
                continue;
            }
            let ddl = format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
                quote_ident(table),
                quote_ident(&column.name),
                wanted.sql_type(),
                widening_cast(&quote_ident(&column.name), current_type, wanted)
            );
            debug!(table, column = %column.name, from = %current_type, to = %wanted, "widening column");
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn mark_modified(
        &mut self,
        table: &str,
        timestamp: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"INSERT INTO modified_log (table_name, "timestamp", modified)
               VALUES ($1, $2, $3)
               ON CONFLICT (table_name, "timestamp")
               DO UPDATE SET modified = GREATEST(modified_log.modified, EXCLUDED.modified)"#,
        )
        .bind(table)
        .bind(timestamp)
        .bind(modified)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

/// A trend store part bound to a PostgreSQL session: the exposed store and
/// retrieve operations.
pub struct PostgresTrendStore {
    storage: PostgresTrendStorage,
    /// The part this store writes to
    pub part: TrendStorePart,
    /// Partitioning of the part's store
    pub partitioning: Partitioning,
}

impl PostgresTrendStore {
    /// Bind a part to a pool.
    pub fn new(
        pool: PgPool,
        part: TrendStorePart,
        partitioning: Partitioning,
    ) -> PostgresTrendStore {
        PostgresTrendStore {
            storage: PostgresTrendStorage::new(pool),
            part,
            partitioning,
        }
    }

    /// Store a refined package, self-healing schema gaps along the way.
    pub async fn store(
        &mut self,
        package: &RefinedPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport> {
        let started = Instant::now();
        match self
            .part
            .store(&mut self.storage, &self.partitioning, package, job_id)
            .await
        {
            Ok(report) => {
                trendbase_observability::record_store_latency(
                    self.part.id,
                    &self.part.name,
                    report.rows_written,
                    started.elapsed(),
                );
                Ok(report)
            }
            Err(error) => {
                trendbase_observability::record_store_failure(
                    self.part.id,
                    &self.part.name,
                    &error.to_string(),
                );
                Err(error)
            }
        }
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

    /// Store with update-merge semantics from the start.
    pub async fn store_update(
        &mut self,
        package: &RefinedPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport> {
        self.part
            .store_update(&mut self.storage, &self.partitioning, package, job_id)
            .await
    }

    /// Read rows for the given columns across every partition overlapping
    /// the half-open interval `[start, end)`. Partitions never written are
    /// skipped; values come back rendered as text.
    pub async fn retrieve(
        &self,
        columns: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<RetrievedRow>> {
        let selected: Vec<String> = columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(c)))
            .collect();
        let mut results = Vec::new();
        for index in self.partitioning.indexes_for_range(start, end) {
            let table = self
                .partitioning
                .interval(index)
                .table_name(&self.part.name);
            let sql = format!(
                "SELECT entity_id, \"timestamp\", {} FROM {} \
                 WHERE \"timestamp\" >= $1 AND \"timestamp\" < $2 \
                 ORDER BY \"timestamp\", entity_id",
                selected.join(", "),
                quote_ident(&table)
            );
            let rows = match sqlx::query(&sql)
                .bind(start)
                .bind(end)
                .fetch_all(self.storage.pool())
                .await
            {
                Ok(rows) => rows,
                Err(error) => match classify(error) {
                    // Nothing was ever written to this interval.
                    StorageError::NoSuchPartition { .. } => continue,
                    other => return Err(other),
                },
            };
            for row in rows {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    values.push(row.try_get::<Option<String>, _>(2 + i).map_err(classify)?);
                }
                results.push(RetrievedRow {
                    entity_id: row.try_get(0).map_err(classify)?,
                    timestamp: row.try_get(1).map_err(classify)?,
                    values,
                });
            }
        }
        Ok(results)
    }
}

/// The USING expression converting a column's existing values to the
/// widened type. Numeric values widening into a timestamp column are Unix
/// epoch seconds, matching the literal parsers; booleans route through
/// integer because PostgreSQL has no direct boolean-to-numeric cast.
fn widening_cast(column: &str, current: DataType, wanted: DataType) -> String {
    match (current, wanted) {
        (DataType::Boolean, DataType::Timestamp) => format!("to_timestamp({column}::integer)"),
        (current, DataType::Timestamp) if !current.is_array() && current != DataType::Text => {
            format!("to_timestamp({column}::double precision)")
        }
        (DataType::Boolean, wanted) => format!("{column}::integer::{}", wanted.sql_type()),
        (_, wanted) => format!("{column}::{}", wanted.sql_type()),
    }
}

/// Quote an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a timestamp in the encoding both COPY and DDL accept.
pub(crate) fn format_pg_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()
}

/// Escape a COPY text-format field.
fn escape_copy(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_cast_expressions() {
        assert_eq!(
            widening_cast("\"Drops\"", DataType::SmallInt, DataType::BigInt),
            "\"Drops\"::bigint"
        );
        assert_eq!(
            widening_cast("\"Drops\"", DataType::SmallInt, DataType::Timestamp),
            "to_timestamp(\"Drops\"::double precision)"
        );
        assert_eq!(
            widening_cast("\"flag\"", DataType::Boolean, DataType::Real),
            "\"flag\"::integer::real"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("Drops"), "\"Drops\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_escape_copy() {
        assert_eq!(escape_copy("plain"), "plain");
        assert_eq!(escape_copy("a\tb\nc\\d"), "a\\tb\\nc\\\\d");
    }

    #[test]
    fn test_format_pg_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2023-05-01T14:05:00.25Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_pg_timestamp(ts), "2023-05-01 14:05:00.250000+00");
    }
}
