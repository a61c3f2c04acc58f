//! SQL query validator.
//!
//! Parses untrusted SQL with `sqlparser`, then runs every policy check against the tree and
//! collects all findings instead of stopping at the first one, so the caller can fix a
//! rejected query in a single round-trip.

use crate::error::ValidationError;
use crate::security::policy::{Policy, is_omop_table, is_source_value_column};
use serde::Serialize;
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, JoinConstraint, JoinOperator,
    ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor,
    TableWithJoins, Visit, Visitor,
};
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Category of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FindingKind {
    SyntaxError,
    EmptyQuery,
    NotSelect,
    UnknownTable,
    ForbiddenTable,
    ForbiddenColumn,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxError => "SyntaxError",
            Self::EmptyQuery => "EmptyQuery",
            Self::NotSelect => "NotSelect",
            Self::UnknownTable => "UnknownTable",
            Self::ForbiddenTable => "ForbiddenTable",
            Self::ForbiddenColumn => "ForbiddenColumn",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broken rule, with the identifiers that broke it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub identifiers: Vec<String>,
    pub message: String,
}

impl Finding {
    pub fn new(kind: FindingKind, identifiers: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            identifiers,
            message: message.into(),
        }
    }
}

/// Outcome of validating one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// Never empty.
    Invalid(Vec<Finding>),
}

impl ValidationResult {
    fn from_findings(findings: Vec<Finding>) -> Self {
        if findings.is_empty() {
            Self::Valid
        } else {
            Self::Invalid(findings)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn findings(&self) -> &[Finding] {
        match self {
            Self::Valid => &[],
            Self::Invalid(findings) => findings,
        }
    }

    pub fn kinds(&self) -> Vec<FindingKind> {
        self.findings().iter().map(|f| f.kind).collect()
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        match self {
            Self::Valid => Ok(()),
            Self::Invalid(findings) => Err(ValidationError::new(findings)),
        }
    }
}

/// Root statement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Exactly one read-only query.
    Select,
    Other,
}

/// A parsed statement plus the identifiers it references.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    statements: Vec<Statement>,
    kind: StatementKind,
    tables: BTreeSet<String>,
    columns: BTreeSet<String>,
    row_references: BTreeSet<String>,
}

impl ParsedQuery {
    /// Parse `sql` in the policy's dialect.
    ///
    /// Returns a `SyntaxError` or `EmptyQuery` finding when there is no tree to inspect.
    pub fn parse(sql: &str, policy: &Policy) -> Result<Self, Finding> {
        let dialect = policy.dialect().parser_dialect();
        let statements = Parser::parse_sql(dialect.as_ref(), sql).map_err(|e| {
            Finding::new(
                FindingKind::SyntaxError,
                vec![],
                format!("SQL syntax error: {}", e),
            )
        })?;

        if statements.is_empty() {
            return Err(Finding::new(
                FindingKind::EmptyQuery,
                vec![],
                "Query cannot be empty",
            ));
        }

        let mut collector = ReferenceCollector::default();
        for statement in &statements {
            let _ = statement.visit(&mut collector);
        }

        let kind = match statements.as_slice() {
            [Statement::Query(_)] if !collector.writes => StatementKind::Select,
            _ => StatementKind::Other,
        };

        let ReferenceCollector {
            tables,
            cte_names,
            aliases,
            columns,
            identifiers,
            hidden,
            ..
        } = collector;

        let row_references = identifiers
            .into_iter()
            .filter(|ident| {
                tables.contains(ident) || aliases.contains(ident) || cte_names.contains(ident)
            })
            .chain(hidden)
            .collect();

        Ok(Self {
            statements,
            kind,
            tables,
            columns,
            row_references,
        })
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_select(&self) -> bool {
        self.kind == StatementKind::Select
    }

    /// Referenced table names, lower-cased, schema prefix dropped.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Referenced column names, lower-cased, qualifier dropped.
    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    /// References that carry columns without naming them: whole-row values such as
    /// `row_to_json(p)` or `row_to_json(p.*)`, alias column lists, `NATURAL` joins and
    /// wildcards in later branches of a set operation, which take the first branch's names.
    pub fn row_references(&self) -> &BTreeSet<String> {
        &self.row_references
    }

    pub fn statement(&self) -> Option<&Statement> {
        self.statements.first()
    }

    /// The statement rendered back from the tree.
    pub fn to_sql(&self) -> String {
        self.statements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// CTE names one query defines, and how many of them are visible at the current point.
///
/// A CTE body only sees the CTEs declared before it (all of them under `WITH RECURSIVE`);
/// the main body sees every one.
struct CteScope {
    names: Vec<String>,
    bodies: Vec<*const Query>,
    recursive: bool,
    visible: usize,
}

impl CteScope {
    fn new(query: &Query) -> Self {
        let (names, bodies, recursive) = match &query.with {
            Some(with) => (
                with.cte_tables
                    .iter()
                    .map(|cte| cte.alias.name.value.to_lowercase())
                    .collect::<Vec<_>>(),
                with.cte_tables
                    .iter()
                    .map(|cte| &*cte.query as *const Query)
                    .collect(),
                with.recursive,
            ),
            None => (vec![], vec![], false),
        };
        let visible = names.len();
        Self {
            names,
            bodies,
            recursive,
            visible,
        }
    }

    fn body_index(&self, query: &Query) -> Option<usize> {
        self.bodies.iter().position(|body| ptr::eq(*body, query))
    }

    fn defines(&self, name: &str) -> bool {
        self.names[..self.visible].iter().any(|n| n == name)
    }
}

#[derive(Default)]
struct ReferenceCollector {
    scopes: Vec<CteScope>,
    tables: BTreeSet<String>,
    cte_names: HashSet<String>,
    aliases: HashSet<String>,
    columns: BTreeSet<String>,
    identifiers: BTreeSet<String>,
    hidden: BTreeSet<String>,
    writes: bool,
}

impl ReferenceCollector {
    fn in_cte_scope(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.defines(name))
    }

    fn alias_columns(&mut self, alias: &TableAlias) {
        if !alias.columns.is_empty() {
            let columns = alias
                .columns
                .iter()
                .map(|c| c.value.to_lowercase())
                .collect::<Vec<_>>()
                .join(", ");
            self.hidden
                .insert(format!("{}({})", alias.name.value.to_lowercase(), columns));
        }
    }

    fn join_constraints(&mut self, from: &TableWithJoins) {
        for join in &from.joins {
            let constraint = match &join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c)
                | JoinOperator::LeftSemi(c)
                | JoinOperator::RightSemi(c)
                | JoinOperator::LeftAnti(c)
                | JoinOperator::RightAnti(c)
                | JoinOperator::AsOf { constraint: c, .. } => c,
                JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => {
                    continue;
                }
            };
            match constraint {
                JoinConstraint::Using(idents) => {
                    self.columns
                        .extend(idents.iter().map(|i| i.value.to_lowercase()));
                }
                JoinConstraint::Natural => {
                    self.hidden.insert("natural join".to_string());
                }
                JoinConstraint::On(_) | JoinConstraint::None => {}
            }
        }
    }

    fn function_arguments(&mut self, function: &Function) {
        let FunctionArguments::List(list) = &function.args else {
            return;
        };
        let is_count = function
            .name
            .0
            .last()
            .is_some_and(|ident| ident.value.eq_ignore_ascii_case("count"));

        for item in &list.args {
            let (FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg)) = item;
            match arg {
                FunctionArgExpr::QualifiedWildcard(prefix) => {
                    self.hidden
                        .insert(format!("{}.*", prefix).to_lowercase());
                }
                FunctionArgExpr::Wildcard if !is_count => {
                    self.hidden.insert("*".to_string());
                }
                _ => {}
            }
        }
    }
}

impl Visitor for ReferenceCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(scope) = self.scopes.last_mut()
            && let Some(index) = scope.body_index(query)
        {
            scope.visible = if scope.recursive {
                scope.names.len()
            } else {
                index
            };
        }

        let scope = CteScope::new(query);
        self.cte_names.extend(scope.names.iter().cloned());
        self.scopes.push(scope);

        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                if projects_wildcard(&cte.query.body) {
                    self.alias_columns(&cte.alias);
                }
            }
        }

        let mut selects = Vec::new();
        collect_selects(&query.body, &mut selects);
        for select in selects {
            for from in &select.from {
                self.join_constraints(from);
            }
        }
        positional_wildcards(&query.body, false, &mut self.hidden);

        if !is_read_query(query) {
            self.writes = true;
        }
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.scopes.pop();
        if let Some(scope) = self.scopes.last_mut()
            && scope.body_index(query).is_some()
        {
            scope.visible = scope.names.len();
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(ident) = relation.0.last() {
            let name = ident.value.to_lowercase();
            // A CTE named like an OMOP table still counts as that table, so deny-lists hold.
            if relation.0.len() > 1 || is_omop_table(&name) || !self.in_cte_scope(&name) {
                self.tables.insert(name);
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        // Whether an alias column list here renames columns the query never names.
        let (alias, renames) = match factor {
            TableFactor::Table { alias, .. } => (alias.as_ref(), true),
            TableFactor::Derived {
                alias, subquery, ..
            } => (alias.as_ref(), projects_wildcard(&subquery.body)),
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                self.join_constraints(table_with_joins);
                (alias.as_ref(), true)
            }
            TableFactor::TableFunction { alias, .. }
            | TableFactor::Function { alias, .. }
            | TableFactor::UNNEST { alias, .. }
            | TableFactor::JsonTable { alias, .. }
            | TableFactor::Pivot { alias, .. }
            | TableFactor::Unpivot { alias, .. }
            | TableFactor::MatchRecognize { alias, .. } => (alias.as_ref(), false),
        };
        if let Some(alias) = alias {
            self.aliases.insert(alias.name.value.to_lowercase());
            if renames {
                self.alias_columns(alias);
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                let name = ident.value.to_lowercase();
                self.identifiers.insert(name.clone());
                self.columns.insert(name);
            }
            Expr::CompoundIdentifier(idents) => {
                if let Some(ident) = idents.last() {
                    self.columns.insert(ident.value.to_lowercase());
                }
            }
            Expr::CompositeAccess { key, .. } => {
                self.columns.insert(key.value.to_lowercase());
            }
            Expr::QualifiedWildcard(prefix) => {
                self.hidden.insert(format!("{}.*", prefix).to_lowercase());
            }
            Expr::Function(function) => self.function_arguments(function),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// The `SELECT` blocks making up one query body, not descending into nested queries.
fn collect_selects<'a>(body: &'a SetExpr, out: &mut Vec<&'a Select>) {
    match body {
        SetExpr::Select(select) => out.push(select),
        SetExpr::SetOperation { left, right, .. } => {
            collect_selects(left, out);
            collect_selects(right, out);
        }
        _ => {}
    }
}

/// Whether any branch of `body` projects `*` or `t.*`.
fn projects_wildcard(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| {
            matches!(
                item,
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)
            )
        }),
        SetExpr::Query(query) => projects_wildcard(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            projects_wildcard(left) || projects_wildcard(right)
        }
        _ => false,
    }
}

/// Wildcards whose columns are renamed by position, i.e. in any branch after the first.
fn positional_wildcards(body: &SetExpr, renamed: bool, out: &mut BTreeSet<String>) {
    match body {
        SetExpr::Select(select) if renamed => {
            for item in &select.projection {
                match item {
                    SelectItem::Wildcard(_) => {
                        out.insert("*".to_string());
                    }
                    SelectItem::QualifiedWildcard(prefix, _) => {
                        out.insert(format!("{}.*", prefix).to_lowercase());
                    }
                    _ => {}
                }
            }
        }
        SetExpr::Query(query) => positional_wildcards(&query.body, renamed, out),
        SetExpr::SetOperation { left, right, .. } => {
            positional_wildcards(left, renamed, out);
            positional_wildcards(right, true, out);
        }
        _ => {}
    }
}

/// A query is read-only when its body only selects and it takes no row locks.
fn is_read_query(query: &Query) -> bool {
    query.locks.is_empty() && is_read_body(&query.body)
}

fn is_read_body(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_query(query),
        SetExpr::SetOperation { left, right, .. } => is_read_body(left) && is_read_body(right),
        _ => false,
    }
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// SQL validator bound to one policy.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    policy: Arc<Policy>,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new(Arc::new(Policy::default()))
    }
}

impl SqlValidator {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Validate a SQL query.
    pub fn validate(&self, sql: &str) -> ValidationResult {
        validate(sql, &self.policy)
    }

    /// Validate and hand back the parsed statement for execution.
    pub fn check(&self, sql: &str) -> Result<ParsedQuery, ValidationError> {
        let (parsed, findings) = analyze(sql, &self.policy);
        match parsed {
            Some(parsed) if findings.is_empty() => Ok(parsed),
            _ => Err(ValidationError::new(findings)),
        }
    }
}

/// Validate `sql` against `policy`. Pure and deterministic.
pub fn validate(sql: &str, policy: &Policy) -> ValidationResult {
    ValidationResult::from_findings(analyze(sql, policy).1)
}

fn analyze(sql: &str, policy: &Policy) -> (Option<ParsedQuery>, Vec<Finding>) {
    debug!("Validating query: {}", truncate(sql, 100));

    let parsed = match ParsedQuery::parse(sql, policy) {
        Ok(parsed) => parsed,
        Err(finding) => {
            warn!(kind = %finding.kind, "Query rejected before analysis");
            return (None, vec![finding]);
        }
    };

    let findings: Vec<Finding> = [
        check_is_select(&parsed),
        check_omop_tables(&parsed),
        check_excluded_tables(&parsed, policy),
        check_excluded_columns(&parsed, policy),
        check_source_value_columns(&parsed, policy),
    ]
    .into_iter()
    .flatten()
    .collect();

    if findings.is_empty() {
        debug!("Query validation passed");
    } else {
        warn!(
            findings = findings.len(),
            kinds = ?findings.iter().map(|f| f.kind).collect::<Vec<_>>(),
            "Query validation failed"
        );
    }

    (Some(parsed), findings)
}

fn check_is_select(parsed: &ParsedQuery) -> Option<Finding> {
    if parsed.is_select() {
        return None;
    }
    Some(Finding::new(
        FindingKind::NotSelect,
        vec![],
        "Only SELECT statements are allowed for security reasons.",
    ))
}

fn check_omop_tables(parsed: &ParsedQuery) -> Option<Finding> {
    let unknown: BTreeSet<String> = parsed
        .tables()
        .iter()
        .filter(|t| !is_omop_table(t))
        .cloned()
        .collect();

    if unknown.is_empty() {
        return None;
    }
    Some(Finding::new(
        FindingKind::UnknownTable,
        unknown.iter().cloned().collect(),
        format!("Tables not found in OMOP CDM: {}", join(&unknown)),
    ))
}

fn check_excluded_tables(parsed: &ParsedQuery, policy: &Policy) -> Option<Finding> {
    let denied: BTreeSet<String> = parsed
        .tables()
        .iter()
        .filter(|t| policy.is_excluded_table(t))
        .cloned()
        .collect();

    if denied.is_empty() {
        return None;
    }
    Some(Finding::new(
        FindingKind::ForbiddenTable,
        denied.iter().cloned().collect(),
        format!("Unauthorized tables in query: {}", join(&denied)),
    ))
}

fn check_excluded_columns(parsed: &ParsedQuery, policy: &Policy) -> Option<Finding> {
    if policy.excluded_columns().is_empty() {
        return None;
    }

    let mut denied: BTreeSet<String> = parsed
        .columns()
        .iter()
        .filter(|c| policy.is_excluded_column(c))
        .cloned()
        .collect();

    // Denied columns could ride along unnamed.
    denied.extend(parsed.row_references().iter().cloned());

    if denied.is_empty() {
        return None;
    }
    Some(Finding::new(
        FindingKind::ForbiddenColumn,
        denied.iter().cloned().collect(),
        format!("Unauthorized columns in query: {}", join(&denied)),
    ))
}

fn check_source_value_columns(parsed: &ParsedQuery, policy: &Policy) -> Option<Finding> {
    if policy.allow_source_value_columns() {
        return None;
    }

    let mut offending: BTreeSet<String> = parsed
        .columns()
        .iter()
        .filter(|c| is_source_value_column(c))
        .cloned()
        .collect();

    // A whole-row value carries every column of the row, source values included.
    offending.extend(parsed.row_references().iter().cloned());

    if offending.is_empty() {
        return None;
    }
    Some(Finding::new(
        FindingKind::ForbiddenColumn,
        offending.iter().cloned().collect(),
        format!(
            "Source value columns are not allowed: {}. \
            Use the corresponding concept_id columns with a join on the concept table instead. \
            Inform the user that this is a security measure to prevent data leakage.",
            join(&offending)
        ),
    ))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> Policy {
        Policy::default()
    }

    fn kinds(sql: &str, policy: &Policy) -> Vec<FindingKind> {
        validate(sql, policy).kinds()
    }

    #[test]
    fn test_valid_select() {
        let policy = strict();
        assert!(
            validate(
                "SELECT person_id, gender_concept_id FROM person WHERE year_of_birth > 1970",
                &policy
            )
            .is_valid()
        );
        assert!(validate("SELECT 1", &policy).is_valid());
        assert!(validate("SELECT count(*) FROM cdm.person;", &policy).is_valid());
    }

    #[test]
    fn test_complex_query_with_joins_and_aliases() {
        let sql = r#"
            SELECT p.person_id, p.gender_concept_id, c.concept_name
            FROM person p
            JOIN concept c ON p.gender_concept_id = c.concept_id
            WHERE p.year_of_birth > 1970
              AND p.person_id IN (SELECT person_id FROM death)
        "#;
        assert!(validate(sql, &strict()).is_valid());
    }

    #[test]
    fn test_cte_names_are_not_tables() {
        let sql = "WITH cohort AS (SELECT person_id FROM person) SELECT count(*) FROM cohort";
        let parsed = ParsedQuery::parse(sql, &strict()).unwrap();
        assert!(parsed.is_select());
        assert_eq!(
            parsed.tables().iter().collect::<Vec<_>>(),
            vec!["person"]
        );
        assert!(validate(sql, &strict()).is_valid());
    }

    #[test]
    fn test_set_operations_are_reads() {
        let sql = "SELECT person_id FROM death UNION SELECT person_id FROM observation_period";
        assert!(validate(sql, &strict()).is_valid());
    }

    #[test]
    fn test_non_select_statements() {
        let policy = strict();
        for sql in [
            "INSERT INTO person (person_id) VALUES (1)",
            "UPDATE person SET year_of_birth = 1900",
            "DELETE FROM person",
            "CREATE TABLE person_copy (person_id INT)",
            "DROP TABLE person",
            "ALTER TABLE person ADD COLUMN x INT",
            "SELECT 1; DELETE FROM person",
            "SELECT person_id INTO person_copy FROM person",
            "SELECT person_id FROM person FOR UPDATE",
        ] {
            assert!(
                kinds(sql, &policy).contains(&FindingKind::NotSelect),
                "expected NotSelect for {sql}"
            );
        }
    }

    #[test]
    fn test_drop_table_scenario() {
        assert_eq!(
            kinds("DROP TABLE person", &strict()),
            vec![FindingKind::NotSelect]
        );
    }

    #[test]
    fn test_unknown_table_scenario() {
        let result = validate("SELECT * FROM nonexistent_table", &strict());
        assert_eq!(result.kinds(), vec![FindingKind::UnknownTable]);
        assert_eq!(result.findings()[0].identifiers, vec!["nonexistent_table"]);
        assert_eq!(
            result.findings()[0].message,
            "Tables not found in OMOP CDM: nonexistent_table"
        );
    }

    #[test]
    fn test_unknown_tables_named_in_one_finding() {
        let result = validate(
            "SELECT u.id FROM users u JOIN person p ON p.person_id = u.id JOIN accounts a ON a.id = u.id",
            &strict(),
        );
        assert_eq!(result.kinds(), vec![FindingKind::UnknownTable]);
        assert_eq!(result.findings()[0].identifiers, vec!["accounts", "users"]);
    }

    #[test]
    fn test_schema_qualified_tables() {
        assert!(validate("SELECT concept_id FROM vocab.concept", &strict()).is_valid());
        assert_eq!(
            kinds("SELECT id FROM public.users", &strict()),
            vec![FindingKind::UnknownTable]
        );
    }

    #[test]
    fn test_findings_are_collected_not_short_circuited() {
        let result = validate("SELECT gender_source_value FROM users", &strict());
        assert_eq!(
            result.kinds(),
            vec![FindingKind::UnknownTable, FindingKind::ForbiddenColumn]
        );

        let result = validate("DELETE FROM users", &strict());
        assert!(result.kinds().contains(&FindingKind::NotSelect));
    }

    #[test]
    fn test_excluded_table() {
        let policy = Policy::builder()
            .exclude_tables(["person", "observation"])
            .build()
            .unwrap();
        let result = validate("SELECT person_id FROM person", &policy);
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenTable]);
        assert_eq!(
            result.findings()[0].message,
            "Unauthorized tables in query: person"
        );
    }

    #[test]
    fn test_excluded_table_cannot_hide_behind_cte() {
        let policy = Policy::builder().exclude_tables(["person"]).build().unwrap();
        let sql = "WITH person AS (SELECT 1 AS person_id) SELECT person_id FROM cdm.person";
        assert!(kinds(sql, &policy).contains(&FindingKind::ForbiddenTable));
    }

    #[test]
    fn test_excluded_column() {
        let policy = Policy::builder()
            .exclude_columns(["year_of_birth", "ethnicity_concept_id"])
            .build()
            .unwrap();
        let result = validate("SELECT year_of_birth FROM person", &policy);
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert_eq!(
            result.findings()[0].message,
            "Unauthorized columns in query: year_of_birth"
        );
    }

    #[test]
    fn test_excluded_table_and_column() {
        let policy = Policy::builder()
            .exclude_tables(["person", "observation"])
            .exclude_columns(["year_of_birth"])
            .build()
            .unwrap();
        assert_eq!(
            kinds("SELECT year_of_birth FROM person", &policy),
            vec![FindingKind::ForbiddenTable, FindingKind::ForbiddenColumn]
        );
    }

    #[test]
    fn test_source_value_columns() {
        let sql = "SELECT person_id, gender_source_value FROM person";

        let result = validate(sql, &strict());
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert!(
            result.findings()[0]
                .message
                .starts_with("Source value columns are not allowed: gender_source_value")
        );

        let relaxed = Policy::builder()
            .allow_source_value_columns(true)
            .build()
            .unwrap();
        assert!(validate(sql, &relaxed).is_valid());
    }

    #[test]
    fn test_source_concept_id_and_qualified_columns() {
        let result = validate(
            "SELECT p.gender_source_concept_id, p.race_source_value FROM person p",
            &strict(),
        );
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert_eq!(
            result.findings()[0].identifiers,
            vec!["gender_source_concept_id", "race_source_value"]
        );
    }

    #[test]
    fn test_source_value_in_where_clause() {
        assert_eq!(
            kinds(
                "SELECT person_id FROM person WHERE gender_source_value = 'F'",
                &strict()
            ),
            vec![FindingKind::ForbiddenColumn]
        );
    }

    #[test]
    fn test_whole_row_references() {
        let result = validate("SELECT row_to_json(p) FROM person p", &strict());
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert_eq!(result.findings()[0].identifiers, vec!["p"]);

        let relaxed = Policy::builder()
            .allow_source_value_columns(true)
            .build()
            .unwrap();
        assert!(validate("SELECT row_to_json(p) FROM person p", &relaxed).is_valid());
    }

    #[test]
    fn test_qualified_wildcard_arguments() {
        let result = validate("SELECT row_to_json(p.*)::text FROM person p", &strict());
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert_eq!(result.findings()[0].identifiers, vec!["p.*"]);

        // Projection wildcards keep column names, so the result filter handles them.
        assert!(validate("SELECT p.* FROM person p", &strict()).is_valid());
        assert!(validate("SELECT count(*) FROM person", &strict()).is_valid());
    }

    #[test]
    fn test_alias_column_lists() {
        let sql = "SELECT c16 FROM person AS p(c1, c2, c3, c4, c5, c6, c7, c8, c9, c10, c11, c12, c13, c14, c15, c16)";
        let result = validate(sql, &strict());
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert!(result.findings()[0].identifiers[0].starts_with("p(c1, c2"));

        let cte = "WITH x(a, b) AS (SELECT * FROM person) SELECT b FROM x";
        assert_eq!(kinds(cte, &strict()), vec![FindingKind::ForbiddenColumn]);

        let derived = "SELECT b FROM (SELECT * FROM person) AS t(a, b)";
        assert_eq!(kinds(derived, &strict()), vec![FindingKind::ForbiddenColumn]);

        // Lists that only rename columns the query already names are fine.
        let named = "WITH x(pid) AS (SELECT person_id FROM person) SELECT pid FROM x";
        assert!(validate(named, &strict()).is_valid());
    }

    #[test]
    fn test_join_using_columns_are_checked() {
        let sql = "SELECT a.person_id FROM person a JOIN person b USING (gender_source_value)";
        let result = validate(sql, &strict());
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert_eq!(result.findings()[0].identifiers, vec!["gender_source_value"]);

        assert!(
            validate(
                "SELECT person_id FROM person JOIN death USING (person_id)",
                &strict()
            )
            .is_valid()
        );
        assert_eq!(
            kinds(
                "SELECT person_id FROM person NATURAL JOIN observation_period",
                &strict()
            ),
            vec![FindingKind::ForbiddenColumn]
        );
    }

    #[test]
    fn test_wildcards_renamed_by_set_operations() {
        let sql = "SELECT 1 AS a, 2 AS b WHERE false UNION ALL SELECT * FROM person";
        let result = validate(sql, &strict());
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert_eq!(result.findings()[0].identifiers, vec!["*"]);

        // The first branch names the columns.
        assert_eq!(
            kinds("SELECT * FROM death UNION SELECT * FROM death", &strict()),
            vec![FindingKind::ForbiddenColumn]
        );
        assert!(
            validate(
                "SELECT person_id FROM death UNION SELECT person_id FROM person",
                &strict()
            )
            .is_valid()
        );
    }

    #[test]
    fn test_hidden_references_respect_column_deny_list() {
        let relaxed = Policy::builder()
            .allow_source_value_columns(true)
            .build()
            .unwrap();
        assert!(validate("SELECT row_to_json(p.*) FROM person p", &relaxed).is_valid());

        let denied = Policy::builder()
            .allow_source_value_columns(true)
            .exclude_columns(["year_of_birth"])
            .build()
            .unwrap();
        let result = validate("SELECT row_to_json(p.*) FROM person p", &denied);
        assert_eq!(result.kinds(), vec![FindingKind::ForbiddenColumn]);
        assert!(result.findings()[0].message.starts_with("Unauthorized columns in query: p.*"));
    }

    #[test]
    fn test_nested_cte_does_not_hide_outer_table() {
        let sql = "SELECT * FROM (WITH pg_user AS (SELECT 1 AS x) SELECT x FROM pg_user) a, pg_user";
        let result = validate(sql, &strict());
        assert_eq!(result.kinds(), vec![FindingKind::UnknownTable]);
        assert_eq!(result.findings()[0].identifiers, vec!["pg_user"]);
    }

    #[test]
    fn test_cte_body_does_not_see_itself() {
        let sql = "WITH pg_user AS (SELECT * FROM pg_user) SELECT * FROM pg_user";
        assert_eq!(kinds(sql, &strict()), vec![FindingKind::UnknownTable]);

        let later = "WITH a AS (SELECT * FROM b), b AS (SELECT person_id FROM person) SELECT * FROM a";
        assert_eq!(
            ParsedQuery::parse(later, &strict())
                .unwrap()
                .tables()
                .iter()
                .collect::<Vec<_>>(),
            vec!["b", "person"]
        );
    }

    #[test]
    fn test_cte_scoping_allows_legitimate_references() {
        let chained = "WITH a AS (SELECT person_id FROM person), b AS (SELECT person_id FROM a) \
            SELECT person_id FROM b";
        assert!(validate(chained, &strict()).is_valid());

        let recursive = "WITH RECURSIVE anc(concept_id) AS ( \
                SELECT ancestor_concept_id FROM concept_ancestor \
                UNION ALL SELECT anc.concept_id FROM anc) \
            SELECT concept_id FROM anc";
        let parsed = ParsedQuery::parse(recursive, &strict()).unwrap();
        assert_eq!(
            parsed.tables().iter().collect::<Vec<_>>(),
            vec!["concept_ancestor"]
        );

        let nested = "SELECT person_id FROM (WITH c AS (SELECT person_id FROM person) \
            SELECT person_id FROM c) t";
        assert!(validate(nested, &strict()).is_valid());
    }

    #[test]
    fn test_case_insensitivity() {
        let policy = strict();
        assert_eq!(
            validate("SELECT person_id FROM PERSON", &policy),
            validate("select person_id from person", &policy)
        );
        assert!(validate("SELECT PERSON_ID FROM \"Person\"", &policy).is_valid());
        assert_eq!(
            kinds("SELECT GENDER_SOURCE_VALUE FROM PERSON", &policy),
            vec![FindingKind::ForbiddenColumn]
        );
    }

    #[test]
    fn test_idempotence() {
        let policy = strict();
        let sql = "SELECT gender_source_value FROM users JOIN note ON true";
        assert_eq!(validate(sql, &policy), validate(sql, &policy));
    }

    #[test]
    fn test_syntax_error_is_a_finding() {
        let result = validate("SELEC person_id FROM person", &strict());
        assert_eq!(result.kinds(), vec![FindingKind::SyntaxError]);
        assert!(result.findings()[0].message.starts_with("SQL syntax error"));
    }

    #[test]
    fn test_empty_query() {
        assert_eq!(kinds("   ", &strict()), vec![FindingKind::EmptyQuery]);
        assert_eq!(kinds(";", &strict()), vec![FindingKind::EmptyQuery]);
    }

    #[test]
    fn test_check_returns_parsed_query() {
        let validator = SqlValidator::default();
        let parsed = validator
            .check("select person_id from cdm.person limit 10")
            .unwrap();
        assert!(parsed.to_sql().to_lowercase().contains("limit 10"));
        assert!(parsed.statement().is_some());

        let err = validator.check("DROP TABLE person").unwrap_err();
        assert_eq!(err.findings()[0].kind, FindingKind::NotSelect);
    }

    #[test]
    fn test_duckdb_dialect() {
        let policy = Policy::builder()
            .dialect(crate::security::SqlDialect::DuckDb)
            .build()
            .unwrap();
        assert!(validate("SELECT person_id FROM person LIMIT 5", &policy).is_valid());
        assert_eq!(
            kinds("SELECT * FROM read_csv('/etc/passwd')", &policy),
            vec![FindingKind::UnknownTable]
        );
    }
}
