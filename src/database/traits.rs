//! Database driver trait.

use crate::database::result::{ColumnInfo, QueryResult};
use crate::error::DbResult;
use async_trait::async_trait;

/// Async database driver trait.
///
/// Implementations: [`PostgresDriver`](crate::database::PostgresDriver) and, with the
/// `duckdb` feature, `DuckDbDriver`.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Returns the driver name (e.g., "postgres").
    fn name(&self) -> &'static str;

    /// Checks if the driver can hand out a live connection.
    async fn is_connected(&self) -> bool;

    /// Executes an already validated, already capped statement in a read-only session.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::QueryFailed`](crate::error::DatabaseError::QueryFailed) if the
    /// store rejects the statement and
    /// [`DatabaseError::NotConnected`](crate::error::DatabaseError::NotConnected) if no
    /// connection is available.
    async fn execute_query(&self, query: &str) -> DbResult<QueryResult>;

    /// Lists the columns of `tables` found in any of `schemas`, ordered by schema, table and
    /// column position.
    async fn list_columns(&self, schemas: &[String], tables: &[String])
    -> DbResult<Vec<ColumnInfo>>;
}
