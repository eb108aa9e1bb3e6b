//! Statement matching
//!
//! Decides which registered policies apply to a parsed statement. SELECT
//! matching sees every table named in FROM/JOIN position anywhere in the
//! statement (subqueries and CTE bodies included); INSERT matching sees the
//! embedded query's body only, so a policy source hidden behind an
//! INSERT-level CTE does not match.

use crate::ast;
use crate::policy::{AggregatePolicy, Policy};
use crate::registry::PolicyRegistry;
use sqlparser::ast::{Query, SetExpr};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// Tables (lowercased) referenced in FROM/JOIN position anywhere in the query.
pub fn select_from_tables(query: &Query) -> BTreeSet<String> {
    ast::all_relation_names(query)
}

/// Tables referenced by an INSERT's embedded query, excluding any CTEs
/// attached at the INSERT level (their aliases still count, their bodies do
/// not).
pub fn insert_from_tables(source: &Query) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let _ = sqlparser::ast::visit_relations(source.body.as_ref(), |relation| {
        let name = relation
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_default();
        names.insert(name);
        ControlFlow::<()>::Continue(())
    });
    names
}

/// Policies applying to a plain SELECT: source-only policies whose sources
/// all appear among the statement's tables.
pub fn match_select<'a>(
    registry: &'a PolicyRegistry,
    from_tables: &BTreeSet<String>,
) -> Vec<&'a Policy> {
    registry
        .policies()
        .iter()
        .filter(|p| p.sink().is_none())
        .filter(|p| !p.sources().is_empty())
        .filter(|p| p.source_names().iter().all(|s| from_tables.contains(s)))
        .collect()
}

/// Policies applying to an INSERT: the sink must equal the target, and
/// every source must appear in the embedded query. Sink-only policies match
/// regardless of sources.
pub fn match_insert<'a>(
    registry: &'a PolicyRegistry,
    sink_table: &str,
    from_tables: &BTreeSet<String>,
) -> Vec<&'a Policy> {
    registry
        .policies()
        .iter()
        .filter(|p| p.sink_lower().as_deref() == Some(sink_table))
        .filter(|p| p.source_names().iter().all(|s| from_tables.contains(s)))
        .collect()
}

pub fn match_insert_aggregate<'a>(
    registry: &'a PolicyRegistry,
    sink_table: &str,
) -> Vec<&'a AggregatePolicy> {
    registry
        .aggregate_policies()
        .iter()
        .filter(|p| p.sink_lower().as_deref() == Some(sink_table))
        .collect()
}

/// True when the query body is a set operation (UNION/INTERSECT/EXCEPT).
/// Policy application to set operators is deliberately not guessed; such
/// statements pass through unchanged.
pub fn is_set_operation(query: &Query) -> bool {
    matches!(query.body.as_ref(), SetExpr::SetOperation { .. })
}
