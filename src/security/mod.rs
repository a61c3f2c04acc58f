//! Query policy and static SQL validation.

pub mod policy;
pub mod validator;

pub use policy::{
    ColumnPattern, OMOP_TABLE_NAMES, Policy, PolicyBuilder, SOURCE_VALUE_SUFFIXES, SqlDialect,
    is_omop_table, is_source_value_column,
};
pub use validator::{
    Finding, FindingKind, ParsedQuery, SqlValidator, StatementKind, ValidationResult, validate,
};
