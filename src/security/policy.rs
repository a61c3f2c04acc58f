//! Access policy for validated queries.
//!
//! The OMOP table vocabulary is fixed; deployments narrow it further with deny-lists and the
//! source-value flag. A [`Policy`] is immutable once built and shared behind an `Arc`.

use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    BigQueryDialect, Dialect, DuckDbDialect, GenericDialect, MsSqlDialect, MySqlDialect,
    PostgreSqlDialect, SQLiteDialect, SnowflakeDialect,
};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// OMOP CDM v5.4 tables, clinical and vocabulary.
pub const OMOP_TABLE_NAMES: &[&str] = &[
    "care_site",
    "cdm_source",
    "concept",
    "concept_ancestor",
    "concept_class",
    "concept_relationship",
    "concept_synonym",
    "condition_era",
    "condition_occurrence",
    "cost",
    "death",
    "device_exposure",
    "domain",
    "dose_era",
    "drug_era",
    "drug_exposure",
    "drug_strength",
    "episode",
    "episode_event",
    "fact_relationship",
    "location",
    "measurement",
    "metadata",
    "note",
    "note_nlp",
    "observation",
    "observation_period",
    "payer_plan_period",
    "person",
    "procedure_occurrence",
    "provider",
    "relationship",
    "specimen",
    "visit_detail",
    "visit_occurrence",
    "vocabulary",
];

static OMOP_TABLES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| OMOP_TABLE_NAMES.iter().copied().collect());

/// Column name suffixes that mark raw, site-specific codes.
pub const SOURCE_VALUE_SUFFIXES: &[&str] = &["_source_value", "_source_concept_id"];

/// Returns true if `name` is an OMOP CDM table (case-insensitive).
pub fn is_omop_table(name: &str) -> bool {
    OMOP_TABLES.contains(name.to_lowercase().as_str())
}

/// Returns true if `name` ends with a source-value suffix (case-insensitive).
pub fn is_source_value_column(name: &str) -> bool {
    let lower = name.to_lowercase();
    SOURCE_VALUE_SUFFIXES
        .iter()
        .any(|suffix| lower.ends_with(suffix))
}

/// SQL dialect used to parse incoming queries.
///
/// Only affects tokenisation and identifier quoting; the checks are dialect-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Postgres,
    DuckDb,
    Generic,
    MySql,
    Sqlite,
    MsSql,
    Snowflake,
    BigQuery,
}

impl SqlDialect {
    /// Parse a dialect name, accepting common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "duckdb" => Some(Self::DuckDb),
            "generic" | "ansi" => Some(Self::Generic),
            "mysql" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            "mssql" | "tsql" | "sqlserver" => Some(Self::MsSql),
            "snowflake" => Some(Self::Snowflake),
            "bigquery" => Some(Self::BigQuery),
            _ => None,
        }
    }

    pub(crate) fn parser_dialect(self) -> Box<dyn Dialect> {
        match self {
            Self::Postgres => Box::new(PostgreSqlDialect {}),
            Self::DuckDb => Box::new(DuckDbDialect {}),
            Self::Generic => Box::new(GenericDialect {}),
            Self::MySql => Box::new(MySqlDialect {}),
            Self::Sqlite => Box::new(SQLiteDialect {}),
            Self::MsSql => Box::new(MsSqlDialect {}),
            Self::Snowflake => Box::new(SnowflakeDialect {}),
            Self::BigQuery => Box::new(BigQueryDialect {}),
        }
    }
}

impl TryFrom<&str> for SqlDialect {
    type Error = ConfigError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s).ok_or_else(|| ConfigError::InvalidValue {
            field: "sql_dialect".into(),
            message: format!(
                "Unknown SQL dialect: '{}'. Valid dialects: postgres, duckdb, generic, mysql, sqlite, mssql, snowflake, bigquery",
                s
            )
            .into(),
        })
    }
}

/// Column deny-list entry. `*` matches any run of characters; everything else is literal.
#[derive(Clone)]
pub struct ColumnPattern {
    source: String,
    regex: Regex,
}

impl ColumnPattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let source = pattern.trim().to_lowercase();
        if source.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "exclude_columns".into(),
                message: "Column pattern cannot be empty".into(),
            });
        }

        let body = source
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| ConfigError::InvalidValue {
            field: "exclude_columns".into(),
            message: format!("Invalid column pattern '{}': {}", pattern, e).into(),
        })?;

        Ok(Self { source, regex })
    }

    /// `column` is expected lower-cased.
    pub fn matches(&self, column: &str) -> bool {
        self.regex.is_match(column)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for ColumnPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ColumnPattern").field(&self.source).finish()
    }
}

/// Immutable validation policy.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    dialect: SqlDialect,
    excluded_tables: BTreeSet<String>,
    excluded_columns: Vec<ColumnPattern>,
    allow_source_value_columns: bool,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn allow_source_value_columns(&self) -> bool {
        self.allow_source_value_columns
    }

    pub fn excluded_tables(&self) -> &BTreeSet<String> {
        &self.excluded_tables
    }

    pub fn excluded_columns(&self) -> &[ColumnPattern] {
        &self.excluded_columns
    }

    /// `table` is expected lower-cased.
    pub fn is_excluded_table(&self, table: &str) -> bool {
        self.excluded_tables.contains(table)
    }

    /// `column` is expected lower-cased.
    pub fn is_excluded_column(&self, column: &str) -> bool {
        self.excluded_columns.iter().any(|p| p.matches(column))
    }

    /// Whether a column may be returned or described under this policy.
    pub fn allows_column(&self, column: &str) -> bool {
        let lower = column.to_lowercase();
        !self.is_excluded_column(&lower)
            && (self.allow_source_value_columns || !is_source_value_column(&lower))
    }

    /// OMOP tables that are not denied, in name order.
    pub fn allowed_tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<&'static str> = OMOP_TABLE_NAMES
            .iter()
            .copied()
            .filter(|t| !self.excluded_tables.contains(*t))
            .collect();
        tables.sort_unstable();
        tables
    }
}

/// Builder for [`Policy`].
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    dialect: SqlDialect,
    excluded_tables: Vec<String>,
    excluded_columns: Vec<String>,
    allow_source_value_columns: bool,
}

impl PolicyBuilder {
    pub fn dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn exclude_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn exclude_columns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_columns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn allow_source_value_columns(mut self, allow: bool) -> Self {
        self.allow_source_value_columns = allow;
        self
    }

    pub fn build(self) -> Result<Policy, ConfigError> {
        let excluded_tables = self
            .excluded_tables
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let excluded_columns = self
            .excluded_columns
            .iter()
            .map(|p| ColumnPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Policy {
            dialect: self.dialect,
            excluded_tables,
            excluded_columns,
            allow_source_value_columns: self.allow_source_value_columns,
        })
    }
}
