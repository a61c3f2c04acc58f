//! Configuration types and builders.
//!
//! Everything is read from the environment at startup. Builders validate on `build()`, so a
//! bad value stops the server before it opens a connection.

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::error::{ConfigError, Result};
use crate::security::{Policy, SqlDialect};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default row cap applied to every query.
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Default per-query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-string prefix that selects the DuckDB store.
pub const DUCKDB_SCHEME: &str = "duckdb://";

static SCHEMA_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("Invalid regex: schema name pattern"));

/// Kind of store behind a connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    DuckDb,
}

impl StoreKind {
    /// `duckdb://<path>` selects DuckDB; anything else is a libpq URL or key/value string.
    pub fn from_connection_string(connection_string: &str) -> Self {
        if connection_string.trim_start().starts_with(DUCKDB_SCHEME) {
            Self::DuckDb
        } else {
            Self::Postgres
        }
    }

    /// Parse dialect used when none is configured.
    pub fn default_dialect(self) -> SqlDialect {
        match self {
            Self::Postgres => SqlDialect::Postgres,
            Self::DuckDb => SqlDialect::DuckDb,
        }
    }

    /// Whether statements parsed in `dialect` can be rendered back and run on this store.
    pub fn supports_dialect(self, dialect: SqlDialect) -> bool {
        match self {
            Self::Postgres => matches!(dialect, SqlDialect::Postgres | SqlDialect::Generic),
            Self::DuckDb => matches!(
                dialect,
                SqlDialect::DuckDb | SqlDialect::Postgres | SqlDialect::Generic
            ),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub connection_string: String,
    pub cdm_schema: String,
    pub vocab_schema: String,
    pub pool_size: usize,
    pub query_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            cdm_schema: "cdm".into(),
            vocab_schema: "vocab".into(),
            pool_size: 8,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl DatabaseConfig {
    pub fn builder() -> DatabaseConfigBuilder {
        DatabaseConfigBuilder::default()
    }

    pub fn store_kind(&self) -> StoreKind {
        StoreKind::from_connection_string(&self.connection_string)
    }

    /// Schemas searched for OMOP tables, clinical first.
    pub fn schemas(&self) -> Vec<String> {
        let mut schemas = vec![self.cdm_schema.clone()];
        if self.vocab_schema != self.cdm_schema {
            schemas.push(self.vocab_schema.clone());
        }
        schemas
    }
}

/// Builder for DatabaseConfig with fluent API.
#[derive(Default)]
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.config.connection_string = connection_string.into();
        self
    }

    pub fn cdm_schema(mut self, schema: impl Into<String>) -> Self {
        self.config.cdm_schema = schema.into();
        self
    }

    pub fn vocab_schema(mut self, schema: impl Into<String>) -> Self {
        self.config.vocab_schema = schema.into();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    /// Read overrides through `lookup`, typically [`std::env::var`].
    pub fn from_lookup(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(connection_string) = lookup("DB_CONNECTION_STRING") {
            self.config.connection_string = connection_string;
        }

        if let Some(schema) = lookup("OMOP_CDM_SCHEMA") {
            self.config.cdm_schema = schema.trim().to_string();
        }

        if let Some(schema) = lookup("OMOP_VOCAB_SCHEMA") {
            self.config.vocab_schema = schema.trim().to_string();
        }

        if let Some(pool_size) = lookup("DATABASE_POOL_SIZE") {
            self.config.pool_size = parse_number("DATABASE_POOL_SIZE", &pool_size)?;
        }

        if let Some(timeout) = lookup("OMOP_QUERY_TIMEOUT_MS") {
            self.config.query_timeout =
                Duration::from_millis(parse_number("OMOP_QUERY_TIMEOUT_MS", &timeout)?);
        }

        Ok(self)
    }

    pub fn build(self) -> Result<DatabaseConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.connection_string.trim().is_empty() {
            return Err(ConfigError::MissingField("DB_CONNECTION_STRING".into()).into());
        }
        for (field, schema) in [
            ("cdm_schema", &self.config.cdm_schema),
            ("vocab_schema", &self.config.vocab_schema),
        ] {
            if !SCHEMA_NAME.is_match(schema) {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    message: format!("Invalid schema name: '{}'", schema).into(),
                }
                .into());
            }
        }
        if self.config.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool_size".into(),
                message: "Pool size must be greater than 0".into(),
            }
            .into());
        }
        if self.config.query_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "query_timeout".into(),
                message: "Query timeout must be greater than 0".into(),
            }
            .into());
        }
        Ok(())
    }
}

/// Validation policy settings, turned into a [`Policy`] at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Parse dialect; `None` follows the store.
    pub dialect: Option<SqlDialect>,
    pub exclude_tables: Vec<String>,
    pub exclude_columns: Vec<String>,
    pub allow_source_value_columns: bool,
}

impl PolicyConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dialect) = lookup("OMOP_SQL_DIALECT") {
            config.dialect = Some(SqlDialect::try_from(dialect.as_str())?);
        }

        if let Some(tables) = lookup("OMOP_EXCLUDE_TABLES") {
            config.exclude_tables = split_list(&tables);
        }

        if let Some(columns) = lookup("OMOP_EXCLUDE_COLUMNS") {
            config.exclude_columns = split_list(&columns);
        }

        if let Some(allow) = lookup("OMOP_ALLOW_SOURCE_VALUE_COLUMNS") {
            config.allow_source_value_columns = parse_bool("OMOP_ALLOW_SOURCE_VALUE_COLUMNS", &allow)?;
        }

        Ok(config)
    }

    /// Build the policy for queries that will run on `store`.
    pub fn build_policy(&self, store: StoreKind) -> Result<Policy> {
        let dialect = self.dialect.unwrap_or_else(|| store.default_dialect());
        if !store.supports_dialect(dialect) {
            return Err(ConfigError::InvalidValue {
                field: "OMOP_SQL_DIALECT".into(),
                message: format!(
                    "Dialect {:?} cannot run on a {:?} store; executed SQL is rendered in the parse dialect",
                    dialect, store
                )
                .into(),
            }
            .into());
        }

        Ok(Policy::builder()
            .dialect(dialect)
            .exclude_tables(self.exclude_tables.iter().cloned())
            .exclude_columns(self.exclude_columns.iter().cloned())
            .allow_source_value_columns(self.allow_source_value_columns)
            .build()?)
    }
}

/// Query executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub row_limit: usize,
    pub cache_capacity: usize,
    pub query_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(limit) = lookup("OMOP_ROW_LIMIT") {
            config.row_limit = parse_number("OMOP_ROW_LIMIT", &limit)?;
        }

        if let Some(capacity) = lookup("OMOP_CACHE_CAPACITY") {
            config.cache_capacity = parse_number("OMOP_CACHE_CAPACITY", &capacity)?;
        }

        if let Some(timeout) = lookup("OMOP_QUERY_TIMEOUT_MS") {
            config.query_timeout =
                Duration::from_millis(parse_number("OMOP_QUERY_TIMEOUT_MS", &timeout)?);
        }

        if config.row_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "OMOP_ROW_LIMIT".into(),
                message: "Row limit must be greater than 0".into(),
            }
            .into());
        }

        Ok(config)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub policy: PolicyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "omop-mcp".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            database: DatabaseConfig::default(),
            executor: ExecutorConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Load the full configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database = DatabaseConfigBuilder::new().from_lookup(lookup)?.build()?;
        let executor = ExecutorConfig::from_lookup(lookup)?;
        let policy = PolicyConfig::from_lookup(lookup)?;

        let config = Self::builder()
            .database(database)
            .executor(executor)
            .policy(policy)
            .build();

        // Surface pattern and dialect errors now rather than at first use.
        config.build_policy()?;
        Ok(config)
    }

    /// Build the validation policy for the configured store.
    pub fn build_policy(&self) -> Result<Policy> {
        self.policy.build_policy(self.database.store_kind())
    }
}

/// Builder for ServerConfig.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.config.database = database;
        self
    }

    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.config.executor = executor;
        self
    }

    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: field.into(),
            message: format!("Expected a non-negative integer, got '{}'", value).into(),
        }
        .into()
    })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.into(),
            message: format!("Expected a boolean, got '{}'", value).into(),
        }
        .into()),
    }
}
