//! Database abstraction layer.
//!
//! The executor talks to the store only through [`DatabaseDriver`]. [`PostgresDriver`] serves
//! PostgreSQL connection strings; `duckdb://<path>` opens a DuckDB file when the `duckdb`
//! feature is enabled.

#[cfg(feature = "duckdb")]
pub mod duckdb;
pub mod postgres;
pub mod result;
pub mod traits;

#[cfg(feature = "duckdb")]
pub use self::duckdb::DuckDbDriver;
pub use postgres::PostgresDriver;
pub use result::*;
pub use traits::DatabaseDriver;

use crate::config::{DatabaseConfig, StoreKind};
use crate::error::DbResult;
use std::sync::Arc;

/// Open the configured store, choosing the driver by connection-string scheme.
pub async fn create_driver(config: &DatabaseConfig) -> DbResult<Arc<dyn DatabaseDriver>> {
    match config.store_kind() {
        StoreKind::Postgres => Ok(Arc::new(PostgresDriver::new(config).await?)),
        #[cfg(feature = "duckdb")]
        StoreKind::DuckDb => Ok(Arc::new(DuckDbDriver::new(config).await?)),
        #[cfg(not(feature = "duckdb"))]
        StoreKind::DuckDb => Err(crate::error::DatabaseError::ConnectionFailed(
            "DuckDB support is not compiled in; rebuild with the `duckdb` feature".into(),
        )),
    }
}
