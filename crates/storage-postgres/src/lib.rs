//! trendbase-storage-postgres
//!
//! PostgreSQL implementation of the trendbase storage traits: bulk COPY and
//! multi-row insert writes, staged update-merge, lazy partition creation,
//! schema self-repair, the modification log, and materialization staleness
//! bookkeeping.

#![warn(missing_docs)]

mod attribute_store;
mod config;
mod entity;
mod error;
mod materialization;
mod schema;
mod trend_store;

pub use attribute_store::PostgresAttributeStore;
pub use config::{PostgresConfig, DATABASE_URL_VAR};
pub use entity::PostgresEntityDirectory;
pub use error::classify;
pub use materialization::{fingerprint, MaterializationState};
pub use schema::{
    bootstrap, register_trend_store, MaterializationStateRow, ModifiedLogRow, TrendStorePartRow,
    TrendStoreRow, BOOTSTRAP_DDL,
};
pub use trend_store::{PostgresTrendStorage, PostgresTrendStore, RetrievedRow};
