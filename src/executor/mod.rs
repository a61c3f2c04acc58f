//! Validated, capped and cached query execution.
//!
//! [`QueryExecutor`] is the only path from caller SQL to the store. Every query is checked by
//! the [`SqlValidator`] first; what reaches the driver is the statement re-rendered from the
//! parse tree, wrapped in a row cap.

mod metrics;

pub use metrics::{ExecutorMetrics, ExecutorMetricsSnapshot};

use crate::cache::{CacheOutcome, CacheStats, QueryCache};
use crate::config::{ExecutorConfig, ServerConfig};
use crate::database::{self, DatabaseDriver, QueryResult, TableSchemaMap, schema_to_csv};
use crate::error::{DatabaseError, DbResult, Result};
use crate::security::{ParsedQuery, Policy, SqlValidator};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Alias given to the capped subquery.
const CAPPED_ALIAS: &str = "omop_capped";

/// Runs validated read queries against the OMOP store.
pub struct QueryExecutor {
    driver: Arc<dyn DatabaseDriver>,
    validator: SqlValidator,
    cache: QueryCache<QueryResult>,
    schema: OnceCell<TableSchemaMap>,
    schemas: Vec<String>,
    config: ExecutorConfig,
    metrics: ExecutorMetrics,
}

impl QueryExecutor {
    /// Open the store described by `config`. Any failure here is fatal for the server.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let policy = Arc::new(config.build_policy()?);
        let driver = database::create_driver(&config.database).await?;

        info!(
            driver = driver.name(),
            row_limit = config.executor.row_limit,
            cache_capacity = config.executor.cache_capacity,
            allow_source_value_columns = policy.allow_source_value_columns(),
            "Query executor ready"
        );

        Ok(Self::new(
            driver,
            policy,
            config.executor.clone(),
            config.database.schemas(),
        ))
    }

    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        policy: Arc<Policy>,
        config: ExecutorConfig,
        schemas: Vec<String>,
    ) -> Self {
        Self {
            driver,
            validator: SqlValidator::new(policy),
            cache: QueryCache::new(config.cache_capacity),
            schema: OnceCell::new(),
            schemas,
            config,
            metrics: ExecutorMetrics::new(),
        }
    }

    pub fn policy(&self) -> &Policy {
        self.validator.policy()
    }

    pub fn driver(&self) -> &Arc<dyn DatabaseDriver> {
        &self.driver
    }

    pub fn row_limit(&self) -> usize {
        self.config.row_limit
    }

    /// Validate, then run `sql` or serve it from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Validation`](crate::error::McpError::Validation) with every finding
    /// if the query is rejected, or a [`DatabaseError`] if the store fails or times out.
    /// Failures are never cached.
    #[instrument(skip(self, sql), fields(len = sql.len()))]
    pub async fn execute(&self, sql: &str) -> Result<Arc<QueryResult>> {
        self.metrics.record_query_received();

        let parsed = self.validator.check(sql).inspect_err(|_| {
            self.metrics.record_query_rejected();
        })?;

        let (result, outcome) = self
            .cache
            .get_or_try_load(sql, || self.run(&parsed))
            .await?;

        if outcome == CacheOutcome::Hit {
            debug!(rows = result.row_count, "Served query from cache");
        }
        Ok(result)
    }

    async fn run(&self, parsed: &ParsedQuery) -> DbResult<QueryResult> {
        let capped = cap_statement(&parsed.to_sql(), self.config.row_limit);

        let mut result = self
            .with_timeout(self.driver.execute_query(&capped))
            .await
            .inspect_err(|_| self.metrics.record_query_error())?;
        self.metrics.record_query_executed();

        let cap = self.config.row_limit;
        if result.rows.len() > cap {
            result.rows.truncate(cap);
            result.row_count = cap;
        }
        if result.row_count >= cap {
            warn!(row_limit = cap, "Result reached the row cap");
            self.metrics.record_truncated();
            result.truncated = true;
        }

        let policy = self.policy();
        result.retain_columns(|column| policy.allows_column(&column.name));

        info!(
            rows = result.row_count,
            elapsed_ms = result.execution_time_ms,
            "Query executed"
        );
        Ok(result)
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = DbResult<T>>) -> DbResult<T> {
        let limit = self.config.query_timeout;
        tokio::time::timeout(limit, fut).await.map_err(|_| {
            warn!(timeout_ms = limit.as_millis() as u64, "Query timed out");
            self.metrics.record_timeout();
            DatabaseError::Timeout(limit.as_millis() as u64)
        })?
    }

    /// Columns of every allowed table, with policy-hidden columns removed.
    ///
    /// Loaded once from the information schema and reused afterwards.
    #[instrument(skip(self))]
    pub async fn describe_schema(&self) -> Result<TableSchemaMap> {
        let schema = self
            .schema
            .get_or_try_init(|| self.load_schema())
            .await?;
        Ok(schema.clone())
    }

    async fn load_schema(&self) -> DbResult<TableSchemaMap> {
        let policy = self.policy();
        let tables: Vec<String> = policy
            .allowed_tables()
            .into_iter()
            .map(String::from)
            .collect();

        let columns = self
            .with_timeout(self.driver.list_columns(&self.schemas, &tables))
            .await?;

        let mut map = TableSchemaMap::new();
        for column in columns {
            let table = column.table.to_lowercase();
            if policy.is_excluded_table(&table) || !policy.allows_column(&column.name) {
                continue;
            }
            map.entry(table).or_default().push(column);
        }

        info!(tables = map.len(), "Loaded OMOP schema description");
        Ok(map)
    }

    /// Schema description as CSV (`table_schema,table_name,column_name,data_type`).
    pub async fn information_schema_csv(&self) -> Result<String> {
        Ok(schema_to_csv(&self.describe_schema().await?))
    }

    /// Run `sql` and render the rows as CSV with a header line.
    pub async fn select_query_csv(&self, sql: &str) -> Result<String> {
        Ok(self.execute(sql).await?.to_csv())
    }

    pub fn metrics(&self) -> ExecutorMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Wrap a validated statement so the store never returns more than `cap` rows.
fn cap_statement(statement: &str, cap: usize) -> String {
    format!("SELECT * FROM ({statement}) AS {CAPPED_ALIAS} LIMIT {cap}")
}
