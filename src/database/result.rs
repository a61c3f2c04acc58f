//! Query result types and CSV rendering.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tabular query result. Rows hold cells in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    /// Set when the row cap was reached.
    pub truncated: bool,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::new(vec![], vec![], 0)
    }

    pub fn new(columns: Vec<Column>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
            truncated: false,
        }
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Drop every column for which `keep` returns false, along with its cells.
    pub fn retain_columns(&mut self, mut keep: impl FnMut(&Column) -> bool) {
        let mask: Vec<bool> = self.columns.iter().map(&mut keep).collect();
        if mask.iter().all(|k| *k) {
            return;
        }

        let mut flags = mask.iter();
        self.columns.retain(|_| *flags.next().unwrap_or(&true));
        for row in &mut self.rows {
            let mut flags = mask.iter();
            row.retain(|_| *flags.next().unwrap_or(&true));
        }
    }

    /// Render as RFC 4180 CSV with a header row.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        push_csv_line(&mut out, self.columns.iter().map(|c| c.name.clone()));
        for row in &self.rows {
            push_csv_line(&mut out, row.iter().map(CellValue::to_text));
        }
        out
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// One result row, cells in projection order.
pub type Row = Vec<CellValue>;

/// Cell value that can hold different SQL types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Plain-text form used in CSV output. NULL renders as an empty field.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Decimal(v) => v.to_string(),
            Self::String(v) => v.clone(),
            Self::Date(v) => v.format("%Y-%m-%d").to_string(),
            Self::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Self::TimestampTz(v) => v.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
        }
    }
}

impl From<()> for CellValue {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One column of an allowed table, as reported by the information schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        name: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Allowed table name to its visible columns.
pub type TableSchemaMap = BTreeMap<String, Vec<ColumnInfo>>;

/// Render a schema map as CSV, one line per column.
pub fn schema_to_csv(schema: &TableSchemaMap) -> String {
    let mut out = String::new();
    push_csv_line(
        &mut out,
        ["table_schema", "table_name", "column_name", "data_type"]
            .into_iter()
            .map(String::from),
    );
    for column in schema.values().flatten() {
        push_csv_line(
            &mut out,
            [
                column.schema.clone(),
                column.table.clone(),
                column.name.clone(),
                column.data_type.clone(),
            ]
            .into_iter(),
        );
    }
    out
}

fn push_csv_line(out: &mut String, fields: impl Iterator<Item = String>) {
    let line: Vec<String> = fields.map(|f| escape_csv_field(&f)).collect();
    out.push_str(&line.join(","));
    out.push('\n');
}

/// Escape a field value according to RFC 4180.
fn escape_csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        let escaped = value.replace('"', "\"\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryResult {
        QueryResult::new(
            vec![
                Column::new("person_id", "int8"),
                Column::new("gender_source_value", "varchar"),
                Column::new("note", "text"),
            ],
            vec![
                vec![CellValue::Int(1), "F".into(), "a, \"b\"".into()],
                vec![CellValue::Int(2), CellValue::Null, "line1\nline2".into()],
            ],
            3,
        )
    }

    #[test]
    fn test_query_result_creation() {
        let result = sample();
        assert_eq!(result.row_count, 2);
        assert_eq!(
            result.column_names(),
            vec!["person_id", "gender_source_value", "note"]
        );
        assert!(!result.truncated);
    }

    #[test]
    fn test_cell_value_conversions() {
        let null: CellValue = ().into();
        assert!(null.is_null());

        let int: CellValue = 42i64.into();
        assert_eq!(int.as_i64(), Some(42));

        let string: CellValue = "hello".into();
        assert_eq!(string.as_str(), Some("hello"));

        let missing: CellValue = Option::<i32>::None.into();
        assert!(missing.is_null());
    }

    #[test]
    fn test_to_csv_keeps_column_order_and_escapes() {
        let csv = sample().to_csv();
        let expected = "person_id,gender_source_value,note\n\
            1,F,\"a, \"\"b\"\"\"\n\
            2,,\"line1\nline2\"\n";
        assert_eq!(csv, expected);
    }

    #[test]
    fn test_retain_columns() {
        let mut result = sample();
        result.retain_columns(|c| !c.name.ends_with("_source_value"));
        assert_eq!(result.column_names(), vec!["person_id", "note"]);
        assert_eq!(result.rows[0], vec![CellValue::Int(1), "a, \"b\"".into()]);
        assert_eq!(result.rows[1].len(), 2);
    }

    #[test]
    fn test_temporal_text() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 31).unwrap();
        assert_eq!(CellValue::Date(date).to_text(), "2020-01-31");
        let ts = date.and_hms_opt(8, 30, 0).unwrap();
        assert_eq!(CellValue::Timestamp(ts).to_text(), "2020-01-31 08:30:00");
    }

    #[test]
    fn test_schema_to_csv() {
        let mut schema = TableSchemaMap::new();
        schema.insert(
            "person".into(),
            vec![
                ColumnInfo::new("cdm", "person", "person_id", "bigint"),
                ColumnInfo::new("cdm", "person", "year_of_birth", "integer"),
            ],
        );
        assert_eq!(
            schema_to_csv(&schema),
            "table_schema,table_name,column_name,data_type\n\
            cdm,person,person_id,bigint\n\
            cdm,person,year_of_birth,integer\n"
        );
    }
}
