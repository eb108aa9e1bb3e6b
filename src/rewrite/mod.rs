//! The rewrite pipeline
//!
//! `transform` parses a statement, finds matching policies, and drives the
//! column propagator, constraint transformer, and plan builder. Plan
//! selection follows the two-phase-canonical rule: aggregation rewrites and
//! anything carrying a `valid` column or a LIMIT go through the CTE shapes
//! in [`two_phase`]; simple scans take the one-phase WHERE rewrite.

pub mod aggregate;
pub mod constraint;
pub mod exists;
pub mod insert;
pub mod matcher;
pub mod propagate;
pub mod two_phase;

use crate::ast::{self, expr};
use crate::catalog::Catalog;
use crate::policy::Policy;
use crate::registry::PolicyRegistry;
use constraint::{ClauseBuilder, Mode, PolicyClauses};
use sqlparser::ast::{Expr, Query, Statement};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error(transparent)]
    Parse(#[from] ast::ParseError),

    #[error("unsupported rewrite: {0}")]
    Unsupported(String),
}

pub struct RewriteContext<'a> {
    pub registry: &'a PolicyRegistry,
    pub catalog: &'a Catalog,
    pub stream_file_path: &'a str,
}

/// Transform one SQL statement so every matching policy is enforced.
/// Statements no policy matches come back normalized but semantically
/// untouched; parse errors bubble up.
pub fn transform(sql: &str, ctx: &RewriteContext<'_>) -> Result<String, RewriteError> {
    let mut stmt = ast::parse_statement(sql)?;
    let rewritten = match &mut stmt {
        Statement::Query(query) => {
            if matcher::is_set_operation(query) || ast::query_select(query).is_none() {
                None
            } else {
                transform_select(query, ctx)?
            }
        }
        Statement::Insert(ins) => {
            insert::rewrite_insert(ins, ctx.registry, ctx.catalog, ctx.stream_file_path)?;
            None
        }
        _ => None,
    };
    match rewritten {
        Some(sql) => Ok(sql),
        None => Ok(ast::to_sql(&stmt)),
    }
}

/// Rewrite a SELECT query. `None` means no policy matched.
fn transform_select(
    query: &Query,
    ctx: &RewriteContext<'_>,
) -> Result<Option<String>, RewriteError> {
    let from_tables = matcher::select_from_tables(query);
    let matching = matcher::match_select(ctx.registry, &from_tables);
    if matching.is_empty() {
        return Ok(None);
    }

    let mut work = query.clone();
    propagate::propagate_columns(&mut work, &matching);

    let sources: BTreeSet<String> = matching.iter().flat_map(|p| p.source_names()).collect();
    let table_map = propagate::source_alias_mapping(&work, &sources);
    let unreachable = propagate::unreachable_sources(&work, &sources, &table_map);

    let select = ast::query_select(&work)
        .ok_or_else(|| RewriteError::Unsupported("SELECT body expected".to_string()))?;
    let mode = if expr::projection_has_aggregate(select) {
        Mode::Grouping
    } else {
        Mode::Scan
    };
    let limited = ast::has_limit(&work);
    let has_invalidate = matching.iter().any(|p| p.action().is_invalidate());

    let sql = match mode {
        Mode::Grouping => match two_phase::aggregation_keys(&work) {
            Some(keys) => {
                grouping_two_phase(&work, keys, limited, &matching, &table_map, ctx)?
            }
            None => one_phase(work, mode, &matching, &table_map, &unreachable, ctx)?,
        },
        Mode::Scan if limited => {
            let mut work = work;
            let aggregate_map = apply_exists_rewrites(&mut work, &unreachable, &matching, ctx)?;
            let clauses = build_clauses(mode, &matching, &table_map, &aggregate_map, ctx)?;
            two_phase::assemble_limited_scan(&mut work, &clauses)?
        }
        Mode::Scan if has_invalidate => match two_phase::scan_keys(&work) {
            Some(keys) => scan_two_phase(&work, keys, &matching, &table_map, &unreachable, ctx)?,
            None => one_phase(work, mode, &matching, &table_map, &unreachable, ctx)?,
        },
        Mode::Scan => one_phase(work, mode, &matching, &table_map, &unreachable, ctx)?,
    };
    Ok(Some(sql))
}

fn build_clauses(
    mode: Mode,
    matching: &[&Policy],
    table_map: &BTreeMap<String, String>,
    aggregate_map: &BTreeMap<String, Expr>,
    ctx: &RewriteContext<'_>,
) -> Result<PolicyClauses, RewriteError> {
    let empty_sink = BTreeMap::new();
    ClauseBuilder {
        mode,
        table_map,
        aggregate_map,
        sink_map: &empty_sink,
        sink_table: None,
        stream_file_path: ctx.stream_file_path,
    }
    .build(matching)
}

/// Rewrite EXISTS-only sources inside `target` (either the working query in
/// one-phase shapes or the policy_eval clone in two-phase shapes).
fn apply_exists_rewrites(
    target: &mut Query,
    unreachable: &BTreeSet<String>,
    matching: &[&Policy],
    ctx: &RewriteContext<'_>,
) -> Result<BTreeMap<String, Expr>, RewriteError> {
    let mut aggregate_map = BTreeMap::new();
    for source in unreachable {
        let schema = ctx.catalog.cached(source).ok_or_else(|| {
            RewriteError::Unsupported(format!("no catalog entry for policy source '{source}'"))
        })?;
        let mut source_aggs = Vec::new();
        for policy in matching {
            source_aggs.extend(expr::collect_aggregates(policy.constraint_expr()));
        }
        aggregate_map.extend(exists::rewrite_exists_source(
            target,
            source,
            schema,
            &source_aggs,
        )?);
    }
    Ok(aggregate_map)
}

/// In-place rewrite: filters into WHERE/HAVING, INVALIDATE columns into the
/// projection.
fn one_phase(
    mut work: Query,
    mode: Mode,
    matching: &[&Policy],
    table_map: &BTreeMap<String, String>,
    unreachable: &BTreeSet<String>,
    ctx: &RewriteContext<'_>,
) -> Result<String, RewriteError> {
    let aggregate_map = apply_exists_rewrites(&mut work, unreachable, matching, ctx)?;
    let clauses = build_clauses(mode, matching, table_map, &aggregate_map, ctx)?;

    let select = ast::query_select_mut(&mut work)
        .ok_or_else(|| RewriteError::Unsupported("SELECT body expected".to_string()))?;
    if let Some(filter) = ast::conjoin(clauses.filters.clone()) {
        match mode {
            Mode::Scan => ast::and_into_where(select, filter),
            Mode::Grouping => ast::and_into_having(select, filter),
        }
    }
    if let Some(valid) = clauses.valid_expr() {
        ast::push_aliased_projection(select, valid, "valid");
    }
    if let Some(message) = clauses.message_expr() {
        ast::push_aliased_projection(select, message, "message");
    }
    Ok(ast::to_sql(&work))
}

fn scan_two_phase(
    work: &Query,
    keys: two_phase::JoinKeys,
    matching: &[&Policy],
    table_map: &BTreeMap<String, String>,
    unreachable: &BTreeSet<String>,
    ctx: &RewriteContext<'_>,
) -> Result<String, RewriteError> {
    let mut base = work.clone();
    if keys == two_phase::JoinKeys::RowId {
        two_phase::add_rowid_to_base(&mut base)?;
    }

    let mut eval = two_phase::policy_eval_skeleton(work);
    let aggregate_map = apply_exists_rewrites(&mut eval, unreachable, matching, ctx)?;
    let clauses = build_clauses(Mode::Scan, matching, table_map, &aggregate_map, ctx)?;
    two_phase::finish_policy_eval(&mut eval, &keys, &clauses, Mode::Scan, false)?;
    two_phase::assemble(&base, &eval, &keys, &clauses)
}

fn grouping_two_phase(
    work: &Query,
    keys: two_phase::JoinKeys,
    limited: bool,
    matching: &[&Policy],
    table_map: &BTreeMap<String, String>,
    ctx: &RewriteContext<'_>,
) -> Result<String, RewriteError> {
    // EXISTS-only sources are rewritten inside policy_eval only; the base
    // query keeps its original EXISTS semantics.
    let sources: BTreeSet<String> = matching.iter().flat_map(|p| p.source_names()).collect();
    let unreachable = propagate::unreachable_sources(work, &sources, table_map);

    let mut base = work.clone();
    let trailing = if limited {
        ast::take_trailing_clauses(&mut base)
    } else {
        Vec::new()
    };

    let mut eval = two_phase::policy_eval_skeleton(work);
    let aggregate_map = apply_exists_rewrites(&mut eval, &unreachable, matching, ctx)?;
    let clauses = build_clauses(Mode::Grouping, matching, table_map, &aggregate_map, ctx)?;
    two_phase::finish_policy_eval(&mut eval, &keys, &clauses, Mode::Grouping, limited)?;

    if limited {
        two_phase::assemble_limited(&base, &eval, &keys, &clauses, &trailing)
    } else {
        two_phase::assemble(&base, &eval, &keys, &clauses)
    }
}
