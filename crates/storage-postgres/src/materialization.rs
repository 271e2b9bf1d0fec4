//! Materialization staleness tracking.
//!
//! Downstream materializations read the `modified` high-water marks of their
//! contributing partitions, fold them into a fingerprint, and recompute the
//! output only when the fingerprint differs from the one recorded with the
//! last output write. The aggregation query itself lives elsewhere; this
//! module only guarantees the compare-and-record bookkeeping.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use trendbase_core::StorageResult;

use crate::error::classify;

/// Stable fingerprint over the contributing (table, modified) marks.
/// Order-insensitive: the marks are sorted before folding.
pub fn fingerprint(sources: &[(String, DateTime<Utc>)]) -> String {
    let mut sorted: Vec<&(String, DateTime<Utc>)> = sources.iter().collect();
    sorted.sort();

    // FNV-1a over "table=micros;" fragments.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for (table, modified) in sorted {
        for byte in table
            .as_bytes()
            .iter()
            .copied()
            .chain(format!("={};", modified.timestamp_micros()).bytes())
        {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    format!("{hash:016x}")
}

/// Access to the `materialization_state` bookkeeping table.
#[derive(Clone)]
pub struct MaterializationState {
    pool: PgPool,
}

impl MaterializationState {
    /// Bookkeeping on the given pool.
    pub fn new(pool: PgPool) -> MaterializationState {
        MaterializationState { pool }
    }

    /// The current `modified` marks for the given source tables at one time
    /// bucket. Tables without a mark have never been written and are absent
    /// from the result.
    pub async fn source_marks(
        &self,
        tables: &[String],
        timestamp: DateTime<Utc>,
    ) -> StorageResult<Vec<(String, DateTime<Utc>)>> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT table_name, modified FROM modified_log
               WHERE table_name = ANY($1) AND "timestamp" = $2
               ORDER BY table_name"#,
        )
        .bind(tables)
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        Ok(rows)
    }

    /// Whether the output for this bucket needs recomputation: true when no
    /// fingerprint is recorded yet or the recorded one differs.
    pub async fn requires_update(
        &self,
        materialization: &str,
        timestamp: DateTime<Utc>,
        fingerprint: &str,
    ) -> StorageResult<bool> {
        let recorded: Option<String> = sqlx::query_scalar(
            r#"SELECT fingerprint FROM materialization_state
               WHERE materialization = $1 AND "timestamp" = $2"#,
        )
        .bind(materialization)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        Ok(recorded.as_deref() != Some(fingerprint))
    }

    /// Record the fingerprint for a freshly written output. Runs inside the
    /// caller's transaction so the record is atomic with the output write.
    pub async fn mark_materialized(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        materialization: &str,
        timestamp: DateTime<Utc>,
        fingerprint: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"INSERT INTO materialization_state (materialization, "timestamp", fingerprint, materialized)
               VALUES ($1, $2, $3, now())
               ON CONFLICT (materialization, "timestamp")
               DO UPDATE SET fingerprint = EXCLUDED.fingerprint, materialized = EXCLUDED.materialized"#,
        )
        .bind(materialization)
        .bind(timestamp)
        .bind(fingerprint)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }
}
