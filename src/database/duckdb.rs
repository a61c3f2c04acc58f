//! DuckDB driver for file-based OMOP extracts.
//!
//! The database file is opened with `access_mode = READ_ONLY` and external access disabled.
//! DuckDB connections are not `Sync`, so the single connection sits behind a mutex and every
//! statement runs on the blocking pool.

use crate::config::{DUCKDB_SCHEME, DatabaseConfig};
use crate::database::result::{CellValue, Column, ColumnInfo, QueryResult, Row};
use crate::database::traits::DatabaseDriver;
use crate::error::{DatabaseError, DbResult};
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime};
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::{AccessMode, Config, Connection, params_from_iter};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// DuckDB database driver.
pub struct DuckDbDriver {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbDriver {
    /// Open the database file read-only and point `search_path` at the OMOP schemas.
    pub async fn new(config: &DatabaseConfig) -> DbResult<Self> {
        let path = database_path(&config.connection_string)?;
        let search_path = config.schemas().join(",");
        info!(
            path = %path.display(),
            cdm_schema = %config.cdm_schema,
            vocab_schema = %config.vocab_schema,
            "Opening DuckDB database"
        );

        let conn = tokio::task::spawn_blocking(move || open_read_only(path, &search_path))
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))??;

        info!("DuckDB database opened read-only");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?
    }
}

#[async_trait]
impl DatabaseDriver for DuckDbDriver {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    async fn is_connected(&self) -> bool {
        self.with_connection(|conn| conn.execute_batch("SELECT 1").map_err(query_failed))
            .await
            .is_ok()
    }

    #[instrument(skip(self, query), fields(db = "duckdb"))]
    async fn execute_query(&self, query: &str) -> DbResult<QueryResult> {
        let start = Instant::now();
        debug!("Executing query: {}", query);

        let sql = query.to_string();
        let (columns, rows) = self.with_connection(move |conn| run_query(conn, &sql)).await?;

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
        if schemas.is_empty() || tables.is_empty() {
            return Ok(Vec::new());
        }

        let sql = columns_query(schemas.len(), tables.len());
        let params: Vec<String> = schemas.iter().chain(tables).cloned().collect();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(query_failed)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(ColumnInfo::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(query_failed)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(query_failed)
        })
        .await
    }
}

/// File path from a `duckdb://<path>` connection string, without any `?` options.
fn database_path(connection_string: &str) -> DbResult<PathBuf> {
    let rest = connection_string
        .trim()
        .strip_prefix(DUCKDB_SCHEME)
        .ok_or_else(|| {
            DatabaseError::ConnectionFailed(format!(
                "DuckDB connection strings start with {DUCKDB_SCHEME}"
            ))
        })?;
    let path = rest.split('?').next().unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return Err(DatabaseError::ConnectionFailed(
            "DuckDB needs a database file; an in-memory database cannot be opened read-only"
                .into(),
        ));
    }
    Ok(PathBuf::from(path))
}

fn open_read_only(path: PathBuf, search_path: &str) -> DbResult<Connection> {
    if !path.is_file() {
        return Err(DatabaseError::ConnectionFailed(format!(
            "DuckDB database file not found: {}",
            path.display()
        )));
    }

    let config = Config::default()
        .access_mode(AccessMode::ReadOnly)
        .and_then(|c| c.enable_external_access(false))
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
    let conn = Connection::open_with_flags(&path, config)
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

    // Schema names are validated identifiers.
    conn.execute_batch(&format!("SET search_path = '{search_path}'"))
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
    Ok(conn)
}

fn columns_query(schemas: usize, tables: usize) -> String {
    let placeholders = |n: usize| vec!["?"; n].join(", ");
    format!(
        "SELECT table_schema, table_name, column_name, data_type \
         FROM information_schema.columns \
         WHERE table_schema IN ({}) AND table_name IN ({}) \
         ORDER BY table_schema, table_name, ordinal_position",
        placeholders(schemas),
        placeholders(tables)
    )
}

fn run_query(conn: &Connection, sql: &str) -> DbResult<(Vec<Column>, Vec<Row>)> {
    let mut stmt = conn.prepare(sql).map_err(query_failed)?;
    let mut rows = stmt.query([]).map_err(query_failed)?;

    let columns: Vec<Column> = match rows.as_ref() {
        Some(stmt) => stmt
            .column_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| Column::new(name, stmt.column_type(i).to_string()))
            .collect(),
        None => Vec::new(),
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_failed)? {
        let cells = (0..columns.len())
            .map(|i| row.get_ref(i).map(cell_value).map_err(query_failed))
            .collect::<DbResult<Row>>()?;
        out.push(cells);
    }
    Ok((columns, out))
}

fn query_failed(e: duckdb::Error) -> DatabaseError {
    DatabaseError::QueryFailed(e.to_string())
}

fn cell_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Boolean(v) => CellValue::Bool(v),
        ValueRef::TinyInt(v) => CellValue::Int(v.into()),
        ValueRef::SmallInt(v) => CellValue::Int(v.into()),
        ValueRef::Int(v) => CellValue::Int(v.into()),
        ValueRef::BigInt(v) => CellValue::Int(v),
        ValueRef::UTinyInt(v) => CellValue::Int(v.into()),
        ValueRef::USmallInt(v) => CellValue::Int(v.into()),
        ValueRef::UInt(v) => CellValue::Int(v.into()),
        ValueRef::UBigInt(v) => {
            i64::try_from(v).map_or_else(|_| CellValue::String(v.to_string()), CellValue::Int)
        }
        ValueRef::HugeInt(v) => {
            i64::try_from(v).map_or_else(|_| CellValue::String(v.to_string()), CellValue::Int)
        }
        ValueRef::Float(v) => CellValue::Float(v.into()),
        ValueRef::Double(v) => CellValue::Float(v),
        ValueRef::Decimal(v) => CellValue::Decimal(v),
        ValueRef::Text(bytes) => CellValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Date32(days) => date_from_days(days).map_or(CellValue::Null, CellValue::Date),
        ValueRef::Timestamp(unit, v) => {
            timestamp(unit, v).map_or(CellValue::Null, CellValue::Timestamp)
        }
        _ => {
            warn!("Unsupported DuckDB value type, returning NULL");
            CellValue::Null
        }
    }
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    if days >= 0 {
        epoch.checked_add_days(Days::new(days.unsigned_abs().into()))
    } else {
        epoch.checked_sub_days(Days::new(days.unsigned_abs().into()))
    }
}

fn timestamp(unit: TimeUnit, value: i64) -> Option<NaiveDateTime> {
    let micros = match unit {
        TimeUnit::Second => value.checked_mul(1_000_000)?,
        TimeUnit::Millisecond => value.checked_mul(1_000)?,
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    };
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::error::McpError;
    use crate::executor::QueryExecutor;
    use crate::security::{Policy, SqlDialect};
    use std::time::Duration;
    use tempfile::TempDir;

    const FIXTURE: &str = r#"
        CREATE SCHEMA cdm;
        CREATE SCHEMA vocab;
        CREATE TABLE cdm.person (
            person_id BIGINT,
            gender_concept_id INTEGER,
            year_of_birth INTEGER,
            birth_datetime TIMESTAMP,
            gender_source_value VARCHAR
        );
        INSERT INTO cdm.person VALUES
            (1, 8507, 1980, TIMESTAMP '1980-04-02 10:30:00', 'M'),
            (2, 8532, 1975, NULL, 'F');
        CREATE TABLE vocab.concept (
            concept_id INTEGER,
            concept_name VARCHAR,
            valid_start_date DATE
        );
        INSERT INTO vocab.concept VALUES
            (8507, 'MALE', DATE '1970-01-01'),
            (8532, 'FEMALE', DATE '1969-12-31');
    "#;

    /// Write the fixture to a fresh file and close the writer before handing out the path.
    fn fixture() -> (TempDir, DatabaseConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("omop.duckdb");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(FIXTURE).unwrap();
        }

        let config = DatabaseConfig {
            connection_string: format!("{DUCKDB_SCHEME}{}", path.display()),
            cdm_schema: "cdm".into(),
            vocab_schema: "vocab".into(),
            pool_size: 1,
            query_timeout: Duration::from_secs(30),
        };
        (dir, config)
    }

    #[test]
    fn test_database_path() {
        assert_eq!(
            database_path("duckdb:///data/omop.duckdb").unwrap(),
            PathBuf::from("/data/omop.duckdb")
        );
        assert_eq!(
            database_path("duckdb://omop.duckdb?access_mode=read_only").unwrap(),
            PathBuf::from("omop.duckdb")
        );
        assert!(database_path("duckdb://").is_err());
        assert!(database_path("duckdb://:memory:").is_err());
        assert!(database_path("postgres://localhost/omop").is_err());
    }

    #[test]
    fn test_columns_query_placeholders() {
        let sql = columns_query(2, 3);
        assert!(sql.contains("table_schema IN (?, ?)"));
        assert!(sql.contains("table_name IN (?, ?, ?)"));
    }

    #[test]
    fn test_date_and_timestamp_conversion() {
        assert_eq!(date_from_days(0), NaiveDate::from_ymd_opt(1970, 1, 1));
        assert_eq!(date_from_days(-1), NaiveDate::from_ymd_opt(1969, 12, 31));
        let ts = timestamp(TimeUnit::Second, 86_400).unwrap();
        assert_eq!(ts.to_string(), "1970-01-02 00:00:00");
        assert_eq!(timestamp(TimeUnit::Microsecond, 1_500_000).unwrap().to_string(), "1970-01-01 00:00:01.500");
    }

    #[tokio::test]
    async fn test_missing_file_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            connection_string: format!("{DUCKDB_SCHEME}{}", dir.path().join("absent.duckdb").display()),
            ..DatabaseConfig::default()
        };
        let err = DuckDbDriver::new(&config).await.err().unwrap();
        assert!(matches!(err, DatabaseError::ConnectionFailed(_)));
        assert!(!dir.path().join("absent.duckdb").exists());
    }

    #[tokio::test]
    async fn test_execute_query_converts_cells() {
        let (_dir, config) = fixture();
        let driver = DuckDbDriver::new(&config).await.unwrap();
        assert_eq!(driver.name(), "duckdb");
        assert!(driver.is_connected().await);

        let result = driver
            .execute_query(
                "SELECT person_id, year_of_birth, birth_datetime, gender_source_value \
                 FROM person ORDER BY person_id",
            )
            .await
            .unwrap();

        assert_eq!(
            result.column_names(),
            vec!["person_id", "year_of_birth", "birth_datetime", "gender_source_value"]
        );
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0][0], CellValue::Int(1));
        assert_eq!(result.rows[0][1], CellValue::Int(1980));
        assert_eq!(
            result.rows[0][2],
            CellValue::Timestamp(
                NaiveDate::from_ymd_opt(1980, 4, 2)
                    .unwrap()
                    .and_hms_opt(10, 30, 0)
                    .unwrap()
            )
        );
        assert_eq!(result.rows[1][2], CellValue::Null);
        assert_eq!(result.rows[1][3], CellValue::String("F".into()));

        let dates = driver
            .execute_query("SELECT valid_start_date FROM concept ORDER BY concept_id")
            .await
            .unwrap();
        assert_eq!(dates.rows[0][0], CellValue::Date(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()));
        assert_eq!(dates.rows[1][0], CellValue::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap()));
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let (_dir, config) = fixture();
        let driver = DuckDbDriver::new(&config).await.unwrap();

        for sql in [
            "INSERT INTO cdm.person VALUES (3, 8507, 1990, NULL, 'M')",
            "DELETE FROM cdm.person",
            "CREATE TABLE cdm.scratch (x INTEGER)",
        ] {
            let err = driver.execute_query(sql).await.unwrap_err();
            assert!(matches!(err, DatabaseError::QueryFailed(_)), "{sql}");
        }

        let count = driver
            .execute_query("SELECT count(*) FROM person")
            .await
            .unwrap();
        assert_eq!(count.rows[0][0], CellValue::Int(2));
    }

    #[tokio::test]
    async fn test_list_columns() {
        let (_dir, config) = fixture();
        let driver = DuckDbDriver::new(&config).await.unwrap();

        let columns = driver
            .list_columns(&config.schemas(), &["person".into(), "concept".into()])
            .await
            .unwrap();

        let names: Vec<(&str, &str)> = columns
            .iter()
            .map(|c| (c.table.as_str(), c.name.as_str()))
            .collect();
        assert_eq!(&names[..2], &[("person", "person_id"), ("person", "gender_concept_id")]);
        assert_eq!(names.last(), Some(&("concept", "valid_start_date")));
        assert_eq!(columns[0].schema, "cdm");
        assert_eq!(columns[0].data_type, "BIGINT");

        assert!(driver.list_columns(&config.schemas(), &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_connection() {
        let (_dir, config) = fixture();
        let driver = DuckDbDriver::new(&config).await.unwrap();

        let (a, b) = tokio::join!(
            driver.execute_query("SELECT person_id FROM person"),
            driver.execute_query("SELECT concept_id FROM concept"),
        );
        assert_eq!(a.unwrap().row_count, 2);
        assert_eq!(b.unwrap().row_count, 2);
    }

    #[tokio::test]
    async fn test_executor_over_duckdb() {
        let (_dir, config) = fixture();
        let driver = Arc::new(DuckDbDriver::new(&config).await.unwrap());
        let policy = Policy::builder().dialect(SqlDialect::DuckDb).build().unwrap();
        let executor = QueryExecutor::new(
            driver,
            Arc::new(policy),
            ExecutorConfig {
                row_limit: 1,
                ..ExecutorConfig::default()
            },
            config.schemas(),
        );

        let result = executor
            .execute("SELECT p.person_id, c.concept_name FROM person p JOIN concept c ON c.concept_id = p.gender_concept_id ORDER BY p.person_id")
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.truncated);
        assert_eq!(result.rows[0][1], CellValue::String("MALE".into()));

        let err = executor
            .execute("SELECT gender_source_value FROM person")
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Validation(_)));

        let schema = executor.describe_schema().await.unwrap();
        assert!(schema.contains_key("person"));
        assert!(
            schema["person"]
                .iter()
                .all(|c| c.name != "gender_source_value")
        );
    }
}
