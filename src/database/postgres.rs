//! PostgreSQL driver using `tokio-postgres` and `deadpool`.
//!
//! Every pooled session is opened read-only with the clinical and vocabulary schemas on its
//! `search_path`, and every statement runs inside a `READ ONLY` transaction.

use crate::config::DatabaseConfig;
use crate::database::result::{CellValue, Column, ColumnInfo, QueryResult, Row};
use crate::database::traits::DatabaseDriver;
use crate::error::{DatabaseError, DbResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use std::time::Instant;
use tokio_postgres::NoTls;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tracing::{debug, info, instrument, warn};

const COLUMNS_QUERY: &str = r#"
    SELECT table_schema::text, table_name::text, column_name::text, data_type::text
    FROM information_schema.columns
    WHERE table_schema::text = ANY($1::text[])
      AND table_name::text = ANY($2::text[])
    ORDER BY table_schema, table_name, ordinal_position
"#;

/// PostgreSQL database driver.
pub struct PostgresDriver {
    pool: Pool,
}

impl PostgresDriver {
    /// Build the pool and check out one connection to prove the store is reachable.
    pub async fn new(config: &DatabaseConfig) -> DbResult<Self> {
        let pg_config = session_config(config)?;
        info!(
            dbname = pg_config.get_dbname().unwrap_or("<default>"),
            user = pg_config.get_user().unwrap_or("<default>"),
            cdm_schema = %config.cdm_schema,
            vocab_schema = %config.vocab_schema,
            "Connecting to PostgreSQL"
        );

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        // Test connection
        let _conn = pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        info!(
            "PostgreSQL connection pool created with max size {}",
            config.pool_size
        );

        Ok(Self { pool })
    }

    async fn query_read_only(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> DbResult<(Vec<Column>, Vec<tokio_postgres::Row>)> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::NotConnected(e.to_string()))?;

        let tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(query_failed)?;

        let stmt = tx.prepare(sql).await.map_err(query_failed)?;
        let columns = stmt
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_().name()))
            .collect();
        let rows = tx.query(&stmt, params).await.map_err(query_failed)?;
        tx.commit().await.map_err(query_failed)?;

        Ok((columns, rows))
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn is_connected(&self) -> bool {
        self.pool.status().available > 0 || self.pool.get().await.is_ok()
    }

    #[instrument(skip(self, query), fields(db = "postgres"))]
    async fn execute_query(&self, query: &str) -> DbResult<QueryResult> {
        let start = Instant::now();
        debug!("Executing query: {}", query);

        let (columns, pg_rows) = self.query_read_only(query, &[]).await?;
        let rows = pg_rows
            .iter()
            .map(convert_row)
            .collect::<DbResult<Vec<Row>>>()?;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(rows = rows.len(), elapsed_ms = elapsed, "Query finished");
        Ok(QueryResult::new(columns, rows, elapsed))
    }

    #[instrument(skip(self))]
    async fn list_columns(
        &self,
        schemas: &[String],
        tables: &[String],
    ) -> DbResult<Vec<ColumnInfo>> {
        let (_, rows) = self
            .query_read_only(COLUMNS_QUERY, &[&schemas, &tables])
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ColumnInfo::new(
                    get::<String>(row, 0)?.unwrap_or_default(),
                    get::<String>(row, 1)?.unwrap_or_default(),
                    get::<String>(row, 2)?.unwrap_or_default(),
                    get::<String>(row, 3)?.unwrap_or_default(),
                ))
            })
            .collect()
    }
}

/// Parse the connection string and append the read-only session settings.
fn session_config(config: &DatabaseConfig) -> DbResult<tokio_postgres::Config> {
    let mut pg_config: tokio_postgres::Config = config
        .connection_string
        .parse()
        .map_err(|e: tokio_postgres::Error| DatabaseError::ConnectionFailed(e.to_string()))?;

    let session = session_options(config);
    let options = match pg_config.get_options() {
        Some(existing) if !existing.trim().is_empty() => format!("{existing} {session}"),
        _ => session,
    };
    pg_config.options(&options);
    Ok(pg_config)
}

fn session_options(config: &DatabaseConfig) -> String {
    format!(
        "-c default_transaction_read_only=on -c search_path={},{} -c statement_timeout={}",
        config.cdm_schema,
        config.vocab_schema,
        config.query_timeout.as_millis()
    )
}

fn query_failed(e: tokio_postgres::Error) -> DatabaseError {
    DatabaseError::QueryFailed(e.to_string())
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, index: usize) -> DbResult<Option<T>> {
    row.try_get::<_, Option<T>>(index)
        .map_err(|e| DatabaseError::QueryFailed(e.to_string()))
}

/// Convert a PostgreSQL row to cells in column order.
fn convert_row(row: &tokio_postgres::Row) -> DbResult<Row> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| cell_value(row, i, col.type_()))
        .collect()
}

fn cell_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> DbResult<CellValue> {
    let value = match *ty {
        Type::BOOL => get::<bool>(row, index)?.map(CellValue::Bool),
        Type::INT2 => get::<i16>(row, index)?.map(|v| CellValue::Int(v.into())),
        Type::INT4 => get::<i32>(row, index)?.map(|v| CellValue::Int(v.into())),
        Type::INT8 => get::<i64>(row, index)?.map(CellValue::Int),
        Type::OID => get::<u32>(row, index)?.map(|v| CellValue::Int(v.into())),
        Type::FLOAT4 => get::<f32>(row, index)?.map(|v| CellValue::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, index)?.map(CellValue::Float),
        Type::NUMERIC => get::<Decimal>(row, index)?.map(CellValue::Decimal),
        Type::DATE => get::<NaiveDate>(row, index)?.map(CellValue::Date),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, index)?.map(CellValue::Timestamp),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, index)?.map(CellValue::TimestampTz),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, index)?.map(CellValue::String)
        }
        _ => match row.try_get::<_, Option<String>>(index) {
            Ok(v) => v.map(CellValue::String),
            Err(_) => {
                warn!(data_type = ty.name(), "Unsupported column type, returning NULL");
                None
            }
        },
    };
    Ok(value.unwrap_or(CellValue::Null))
}
