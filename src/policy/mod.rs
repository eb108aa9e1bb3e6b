//! Data Flow Control policy model
//!
//! A policy binds a boolean SQL constraint over source/sink tables to an
//! enforcement action. Construction validates syntax only; binding against
//! the live catalog happens at registration (see [`crate::registry`]).

pub mod dsl;
pub mod lowering;

use crate::ast::{self, expr};
use serde::Serialize;
use sqlparser::ast::Expr;
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy parse error: {0}")]
    ParseError(String),

    #[error("{kind} table name '{name}' is not a valid table identifier")]
    InvalidIdentifier { kind: &'static str, name: String },

    #[error(
        "all columns in constraints must be qualified with table names; \
         unqualified columns found: {columns}"
    )]
    UnqualifiedColumn { columns: String },

    #[error("aggregation '{aggregate}' references table '{table}', but aggregations can only reference source tables")]
    IllegalAggregationTarget { aggregate: String, table: String },

    #[error("all columns from source table '{table}' must be aggregated; unaggregated source columns found: {columns}")]
    SourceNotAggregated { table: String, columns: String },

    #[error("either source or sink must be provided")]
    MissingSourceOrSink,

    #[error("aggregate policies currently only support INVALIDATE resolution")]
    UnsupportedAction,

    #[error("{kind} table '{name}' does not exist in the database")]
    UnknownTable { kind: &'static str, name: String },

    #[error("column '{table}.{column}' referenced in constraint does not exist in {kind} table '{table}'")]
    UnknownColumn {
        kind: &'static str,
        table: String,
        column: String,
    },

    #[error("sink table '{sink}' must have a {expected} column named '{column}' for {action} resolution policies")]
    MissingValidColumn {
        sink: String,
        column: &'static str,
        expected: &'static str,
        action: Action,
    },
}

/// What to do with rows that violate a policy constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(ascii_case_insensitive)]
pub enum Action {
    #[strum(serialize = "REMOVE")]
    Remove,
    #[strum(serialize = "KILL")]
    Kill,
    #[strum(serialize = "INVALIDATE")]
    Invalidate,
    #[strum(serialize = "INVALIDATE_MESSAGE")]
    InvalidateMessage,
    #[strum(serialize = "HUMAN")]
    Human,
    #[strum(serialize = "LLM")]
    Llm,
}

impl Action {
    /// Actions that surface a `valid` (and possibly `message`) column
    /// instead of filtering rows.
    pub fn is_invalidate(self) -> bool {
        matches!(self, Action::Invalidate | Action::InvalidateMessage)
    }

    /// Actions that hand violating rows to an external resolver.
    pub fn is_resolver(self) -> bool {
        matches!(self, Action::Human | Action::Llm)
    }
}

/// A Data Flow Control policy. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct Policy {
    sources: Vec<String>,
    sink: Option<String>,
    constraint: String,
    action: Action,
    description: Option<String>,
    #[serde(skip)]
    constraint_expr: Expr,
    /// Per-source columns the lowered constraint needs, lowercased, in
    /// first-occurrence order. Computed once at construction.
    #[serde(skip)]
    source_columns_needed: BTreeMap<String, Vec<String>>,
}

impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        self.sources == other.sources
            && self.sink == other.sink
            && self.constraint == other.constraint
            && self.action == other.action
            && self.description == other.description
    }
}

impl Policy {
    pub fn new(
        sources: Vec<String>,
        sink: Option<String>,
        constraint: &str,
        action: Action,
        description: Option<String>,
    ) -> Result<Self, PolicyError> {
        if sources.is_empty() && sink.is_none() {
            return Err(PolicyError::MissingSourceOrSink);
        }
        for source in &sources {
            validate_table_name(source, "source")?;
        }
        if let Some(sink) = &sink {
            validate_table_name(sink, "sink")?;
        }

        let constraint_expr = parse_constraint(constraint)?;
        validate_column_qualification(&constraint_expr, &[])?;
        validate_aggregation_rules(&constraint_expr, &sources, sink.as_deref(), false)?;

        let source_columns_needed = derive_source_columns(&constraint_expr, &sources);

        Ok(Self {
            sources,
            sink,
            constraint: constraint.to_string(),
            action,
            description,
            constraint_expr,
            source_columns_needed,
        })
    }

    /// Parse the DSL text form. Rejects `AGGREGATE`-prefixed text; use
    /// [`AggregatePolicy::from_text`] for those.
    pub fn from_text(text: &str) -> Result<Self, PolicyError> {
        let parsed = dsl::parse_policy_text(text)?;
        if parsed.aggregate {
            return Err(PolicyError::ParseError(
                "AGGREGATE policies must be constructed as aggregate policies".to_string(),
            ));
        }
        Self::new(
            parsed.sources,
            parsed.sink,
            &parsed.constraint,
            parsed.action,
            parsed.description,
        )
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Lowercased source names.
    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.to_lowercase()).collect()
    }

    pub fn sink(&self) -> Option<&str> {
        self.sink.as_deref()
    }

    pub fn sink_lower(&self) -> Option<String> {
        self.sink.as_ref().map(|s| s.to_lowercase())
    }

    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    pub(crate) fn constraint_expr(&self) -> &Expr {
        &self.constraint_expr
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Columns of `table` the post-lowering constraint references,
    /// lowercased, in first-occurrence order. Empty when `table` is not a
    /// source of this policy.
    pub fn source_columns_needed(&self, table: &str) -> &[String] {
        self.source_columns_needed
            .get(&table.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// A short identifier for log and violation messages.
    pub fn identifier(&self) -> String {
        let mut parts = Vec::new();
        if !self.sources.is_empty() {
            parts.push(format!("sources={}", self.sources.join(",")));
        }
        if let Some(sink) = &self.sink {
            parts.push(format!("sink={sink}"));
        }
        parts.push(format!("constraint={}", self.constraint));
        format!("Policy({})", parts.join(", "))
    }
}

/// An aggregate policy: the constraint spans an entire sink table's worth
/// of rows, so enforcement happens in two stages. At INSERT time the
/// rewriter stashes per-row inputs into `_{id}_tmpN` sink columns; a later
/// `finalize_aggregate_policies` call applies the outer aggregation and
/// reports violations.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatePolicy {
    source: Option<String>,
    sink: Option<String>,
    constraint: String,
    action: Action,
    description: Option<String>,
    #[serde(skip)]
    constraint_expr: Expr,
    id: String,
}

impl PartialEq for AggregatePolicy {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.sink == other.sink
            && self.constraint == other.constraint
            && self.action == other.action
            && self.description == other.description
    }
}

impl AggregatePolicy {
    pub fn new(
        source: Option<String>,
        sink: Option<String>,
        constraint: &str,
        action: Action,
        description: Option<String>,
    ) -> Result<Self, PolicyError> {
        if source.is_none() && sink.is_none() {
            return Err(PolicyError::MissingSourceOrSink);
        }
        if action != Action::Invalidate {
            return Err(PolicyError::UnsupportedAction);
        }
        if let Some(source) = &source {
            validate_table_name(source, "source")?;
        }
        if let Some(sink) = &sink {
            validate_table_name(sink, "sink")?;
        }

        let constraint_expr = parse_constraint(constraint)?;

        // A bare table name as an aggregate argument (e.g. `sum(irs_form)`)
        // stands for the whole row and is exempt from qualification.
        let mut exempt: Vec<String> = Vec::new();
        if let Some(s) = &source {
            exempt.push(s.to_lowercase());
        }
        if let Some(s) = &sink {
            exempt.push(s.to_lowercase());
        }
        validate_column_qualification(&constraint_expr, &exempt)?;

        let sources: Vec<String> = source.iter().cloned().collect();
        validate_aggregation_rules(&constraint_expr, &sources, sink.as_deref(), true)?;

        let id = policy_identifier(
            source.as_deref(),
            sink.as_deref(),
            constraint,
            action,
            description.as_deref(),
        );

        Ok(Self {
            source,
            sink,
            constraint: constraint.to_string(),
            action,
            description,
            constraint_expr,
            id,
        })
    }

    pub fn from_text(text: &str) -> Result<Self, PolicyError> {
        let parsed = dsl::parse_policy_text(text)?;
        if !parsed.aggregate {
            return Err(PolicyError::ParseError(
                "aggregate policy text must start with AGGREGATE".to_string(),
            ));
        }
        let mut sources = parsed.sources;
        if sources.len() > 1 {
            return Err(PolicyError::ParseError(
                "aggregate policies accept at most one SOURCE".to_string(),
            ));
        }
        Self::new(
            sources.pop(),
            parsed.sink,
            &parsed.constraint,
            parsed.action,
            parsed.description,
        )
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn source_lower(&self) -> Option<String> {
        self.source.as_ref().map(|s| s.to_lowercase())
    }

    pub fn sink(&self) -> Option<&str> {
        self.sink.as_deref()
    }

    pub fn sink_lower(&self) -> Option<String> {
        self.sink.as_ref().map(|s| s.to_lowercase())
    }

    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    pub(crate) fn constraint_expr(&self) -> &Expr {
        &self.constraint_expr
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Deterministic identifier, stable across processes. Temp column names
    /// derived from it persist in sink schemas, so this must not depend on
    /// process-local state.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the Nth (1-based) temp column this policy stashes inputs in.
    pub fn temp_column(&self, n: usize) -> String {
        format!("_{}_tmp{n}", self.id)
    }
}

/// `policy_<fnv1a-hex>` over the policy's identity fields.
fn policy_identifier(
    source: Option<&str>,
    sink: Option<&str>,
    constraint: &str,
    action: Action,
    description: Option<&str>,
) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash ^= 0x1f;
        hash = hash.wrapping_mul(0x100000001b3);
    };
    feed(source.unwrap_or("").as_bytes());
    feed(sink.unwrap_or("").as_bytes());
    feed(constraint.as_bytes());
    feed(action.to_string().as_bytes());
    feed(description.unwrap_or("").as_bytes());
    format!("policy_{hash:016x}")
}

fn validate_table_name(name: &str, kind: &'static str) -> Result<(), PolicyError> {
    let invalid = || PolicyError::InvalidIdentifier {
        kind,
        name: name.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid());
    }
    let stmt = ast::parse_statement(&format!("SELECT * FROM {name}")).map_err(|_| invalid())?;
    let query = ast::statement_query(&stmt).ok_or_else(invalid)?;
    let select = ast::query_select(query).ok_or_else(invalid)?;
    let tables = ast::tables_in_from(select);
    if tables.len() != 1 || tables[0].alias.is_some() {
        return Err(invalid());
    }
    Ok(())
}

fn parse_constraint(constraint: &str) -> Result<Expr, PolicyError> {
    let trimmed = constraint.trim();
    if trimmed.is_empty() {
        return Err(PolicyError::ParseError("constraint is empty".to_string()));
    }
    if trimmed.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("select")) {
        return Err(PolicyError::ParseError(
            "constraint must be an expression, not a SELECT statement".to_string(),
        ));
    }
    let expr = ast::parse_expr(trimmed).map_err(|e| {
        PolicyError::ParseError(format!("invalid constraint SQL expression '{trimmed}': {e}"))
    })?;
    if matches!(expr, Expr::Subquery(_)) {
        return Err(PolicyError::ParseError(
            "constraint must be an expression, not a SELECT statement".to_string(),
        ));
    }
    Ok(expr)
}

fn validate_column_qualification(
    constraint: &Expr,
    exempt_bare_tables: &[String],
) -> Result<(), PolicyError> {
    let unqualified: Vec<String> = expr::collect_columns(constraint)
        .into_iter()
        .filter(|occ| occ.table.is_none())
        .filter(|occ| {
            !(occ.in_aggregate && exempt_bare_tables.contains(&occ.column_lower()))
        })
        .map(|occ| occ.column)
        .collect();
    if unqualified.is_empty() {
        Ok(())
    } else {
        Err(PolicyError::UnqualifiedColumn {
            columns: unqualified.join(", "),
        })
    }
}

fn validate_aggregation_rules(
    constraint: &Expr,
    sources: &[String],
    sink: Option<&str>,
    allow_sink_aggregation: bool,
) -> Result<(), PolicyError> {
    let source_names: Vec<String> = sources.iter().map(|s| s.to_lowercase()).collect();
    let sink_lower = sink.map(|s| s.to_lowercase());

    let aggregates = expr::collect_aggregates(constraint);
    if !aggregates.is_empty() && !allow_sink_aggregation && source_names.is_empty() {
        return Err(PolicyError::IllegalAggregationTarget {
            aggregate: ast::to_sql(&Expr::Function(aggregates[0].clone())),
            table: "<none>".to_string(),
        });
    }

    if !allow_sink_aggregation {
        for func in &aggregates {
            let func_expr = Expr::Function(func.clone());
            for occ in expr::collect_columns(&func_expr) {
                let Some(table) = occ.table else { continue };
                if Some(&table) == sink_lower.as_ref() || !source_names.contains(&table) {
                    return Err(PolicyError::IllegalAggregationTarget {
                        aggregate: ast::to_sql(&func_expr),
                        table,
                    });
                }
            }
        }
    }

    // Every source-qualified column must sit inside an aggregate.
    for source in &source_names {
        let unaggregated: Vec<String> = expr::collect_columns(constraint)
            .into_iter()
            .filter(|occ| occ.table.as_deref() == Some(source.as_str()) && !occ.in_aggregate)
            .map(|occ| format!("{source}.{}", occ.column))
            .collect();
        if !unaggregated.is_empty() {
            return Err(PolicyError::SourceNotAggregated {
                table: source.clone(),
                columns: unaggregated.join(", "),
            });
        }
    }

    Ok(())
}

/// Per-source needed columns after aggregation lowering: the columns inside
/// aggregates plus any bare (non-aggregated) references.
fn derive_source_columns(constraint: &Expr, sources: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    for source in sources {
        let lower = source.to_lowercase();
        let columns = expr::columns_of_table(constraint, &lower);
        map.insert(lower, columns);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!("remove".parse::<Action>().unwrap(), Action::Remove);
        assert_eq!("KILL".parse::<Action>().unwrap(), Action::Kill);
        assert_eq!(
            "invalidate_message".parse::<Action>().unwrap(),
            Action::InvalidateMessage
        );
        assert!("explode".parse::<Action>().is_err());
    }

    #[test]
    fn action_displays_canonical_form() {
        assert_eq!(Action::InvalidateMessage.to_string(), "INVALIDATE_MESSAGE");
        assert_eq!(Action::Llm.to_string(), "LLM");
    }

    #[test]
    fn policy_identifier_is_stable_and_distinct() {
        let a = policy_identifier(Some("users"), None, "sum(users.amount) > 100", Action::Invalidate, None);
        let b = policy_identifier(Some("users"), None, "sum(users.amount) > 100", Action::Invalidate, None);
        let c = policy_identifier(Some("users"), None, "sum(users.amount) > 200", Action::Invalidate, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("policy_"));
    }

    #[test]
    fn source_columns_follow_first_occurrence_order() {
        let policy = Policy::new(
            vec!["foo".to_string()],
            None,
            "max(foo.name) = 'x' AND max(foo.id) > 1",
            Action::Remove,
            None,
        )
        .unwrap();
        assert_eq!(policy.source_columns_needed("foo"), ["name", "id"]);
        assert_eq!(policy.source_columns_needed("other"), [] as [&str; 0]);
    }

    #[test]
    fn equality_ignores_derived_fields() {
        let a = Policy::new(vec!["foo".into()], None, "max(foo.id) > 1", Action::Remove, None).unwrap();
        let b = Policy::new(vec!["foo".into()], None, "max(foo.id) > 1", Action::Remove, None).unwrap();
        let c = Policy::new(vec!["foo".into()], None, "max(foo.id) > 2", Action::Remove, None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
