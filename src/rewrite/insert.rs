//! INSERT statement rewriting
//!
//! INSERTs are rewritten in place: the policy clauses land in the embedded
//! SELECT's WHERE/HAVING, INVALIDATE expressions thread into the sink's
//! `valid` (and `message`) columns, and aggregate policies stash their
//! per-row inputs in `_{id}_tmpN` columns. VALUES-only INSERTs pass
//! through untouched.
//!
//! Sink-column references in constraints have no row to bind to, so they
//! are substituted with the SELECT output that will populate the column;
//! outputs get aliases matching the sink column names first (DuckDB lets
//! later clauses reference projection aliases).

use crate::ast::{self, expr};
use crate::catalog::Catalog;
use crate::registry::PolicyRegistry;
use crate::rewrite::aggregate as agg_rewrite;
use crate::rewrite::constraint::{ClauseBuilder, Mode};
use crate::rewrite::{exists, matcher, propagate, RewriteError};
use sqlparser::ast::{Expr, Ident, Insert, SelectItem};
use std::collections::{BTreeMap, BTreeSet};

/// Rewrite the INSERT in place. Returns `false` when no policy applies and
/// the statement was left untouched.
pub fn rewrite_insert(
    insert: &mut Insert,
    registry: &PolicyRegistry,
    catalog: &Catalog,
    stream_file_path: &str,
) -> Result<bool, RewriteError> {
    let sink = insert
        .table_name
        .0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default();

    let Some(source) = insert.source.as_deref() else {
        return Ok(false);
    };
    if ast::query_select(source).is_none() {
        // VALUES lists and set operations pass through.
        return Ok(false);
    }

    let from_tables = matcher::insert_from_tables(source);
    let matching = matcher::match_insert(registry, &sink, &from_tables);
    let aggregate_matching = matcher::match_insert_aggregate(registry, &sink);
    if matching.is_empty() && aggregate_matching.is_empty() {
        return Ok(false);
    }

    let has_invalidate = matching.iter().any(|p| p.action().is_invalidate());
    let has_message = matching
        .iter()
        .any(|p| p.action() == crate::policy::Action::InvalidateMessage);

    // Column list the SELECT outputs map onto: the explicit INSERT list, or
    // the sink's catalog order when the list is omitted.
    let explicit_columns: Vec<String> = insert
        .columns
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect();
    let user_valid_position = explicit_columns.iter().position(|c| c == "valid");
    let mapping_columns: Vec<String> = if !explicit_columns.is_empty() {
        explicit_columns.clone()
    } else {
        catalog
            .cached(&sink)
            .map(|schema| schema.column_names().map(str::to_string).collect())
            .unwrap_or_default()
    };

    if has_invalidate && !explicit_columns.is_empty() && user_valid_position.is_none() {
        insert.columns.push(Ident::new("valid"));
    }
    if has_message && !explicit_columns.is_empty() && !explicit_columns.iter().any(|c| c == "message")
    {
        insert.columns.push(Ident::new("message"));
    }

    let source = insert.source.as_deref_mut().expect("checked above");
    alias_outputs_to_sink_columns(source, &mapping_columns);

    // Maps for sink-column substitution: constraint clauses reference the
    // output alias; aggregate temp columns need the output expression
    // itself (the FILTER predicate must see the concrete value).
    let (sink_alias_map, sink_value_map) = sink_maps(source, &mapping_columns);

    propagate::propagate_columns(source, &matching);

    let sources_union: BTreeSet<String> = matching
        .iter()
        .flat_map(|p| p.source_names())
        .collect();
    let table_map = propagate::source_alias_mapping(source, &sources_union);
    let unreachable = propagate::unreachable_sources(source, &sources_union, &table_map);

    let mode = if ast::query_select(source)
        .map(expr::projection_has_aggregate)
        .unwrap_or(false)
    {
        Mode::Grouping
    } else {
        Mode::Scan
    };

    let mut aggregate_map = BTreeMap::new();
    for unreachable_source in &unreachable {
        let schema = catalog.cached(unreachable_source).ok_or_else(|| {
            RewriteError::Unsupported(format!(
                "no catalog entry for policy source '{unreachable_source}'"
            ))
        })?;
        let mut source_aggs = Vec::new();
        for policy in &matching {
            source_aggs.extend(expr::collect_aggregates(policy.constraint_expr()));
        }
        aggregate_map.extend(exists::rewrite_exists_source(
            source,
            unreachable_source,
            schema,
            &source_aggs,
        )?);
    }

    let clauses = ClauseBuilder {
        mode,
        table_map: &table_map,
        aggregate_map: &aggregate_map,
        sink_map: &sink_alias_map,
        sink_table: Some(&sink),
        stream_file_path,
    }
    .build(&matching)?;

    let select = ast::query_select_mut(source).expect("checked above");
    if let Some(filter) = ast::conjoin(clauses.filters.clone()) {
        match mode {
            Mode::Scan => ast::and_into_where(select, filter),
            Mode::Grouping => ast::and_into_having(select, filter),
        }
    }
    if let Some(valid) = clauses.valid_expr() {
        match user_valid_position {
            Some(pos) if pos < select.projection.len() => {
                select.projection[pos] = SelectItem::ExprWithAlias {
                    expr: valid,
                    alias: Ident::new("valid"),
                };
            }
            _ => ast::push_aliased_projection(select, valid, "valid"),
        }
    }
    if let Some(message) = clauses.message_expr() {
        ast::push_aliased_projection(select, message, "message");
    }

    // Aggregate policies: one temp column per constraint aggregate.
    for policy in &aggregate_matching {
        let temp_exprs = agg_rewrite::insert_temp_exprs(policy, mode, &sink_value_map)?;
        for (n, temp_expr) in temp_exprs.into_iter().enumerate() {
            let name = policy.temp_column(n + 1);
            if !insert.columns.is_empty() {
                insert.columns.push(Ident::new(name.clone()));
            }
            let select = ast::query_select_mut(insert.source.as_deref_mut().expect("source"))
                .expect("checked above");
            ast::push_aliased_projection(select, temp_expr, &name);
        }
    }

    Ok(true)
}

/// Give SELECT outputs aliases matching the sink columns they populate, so
/// substituted constraints can reference them by name. Bare columns that
/// already carry the right name are left alone.
fn alias_outputs_to_sink_columns(source: &mut sqlparser::ast::Query, mapping_columns: &[String]) {
    let Some(select) = ast::query_select_mut(source) else {
        return;
    };
    for (i, sink_column) in mapping_columns.iter().enumerate() {
        let Some(item) = select.projection.get_mut(i) else {
            break;
        };
        let current_name = ast::projection_name(item);
        match item {
            SelectItem::ExprWithAlias { .. }
            | SelectItem::Wildcard(_)
            | SelectItem::QualifiedWildcard(..) => continue,
            SelectItem::UnnamedExpr(expr) => {
                if current_name.as_deref() == Some(sink_column.as_str()) {
                    continue;
                }
                let taken = std::mem::replace(expr, Expr::Value(sqlparser::ast::Value::Null));
                *item = SelectItem::ExprWithAlias {
                    expr: taken,
                    alias: Ident::new(sink_column.clone()),
                };
            }
        }
    }
}

/// (alias references, output expressions) keyed by lowercased sink column.
fn sink_maps(
    source: &sqlparser::ast::Query,
    mapping_columns: &[String],
) -> (BTreeMap<String, Expr>, BTreeMap<String, Expr>) {
    let mut alias_map = BTreeMap::new();
    let mut value_map = BTreeMap::new();
    let Some(select) = ast::query_select(source) else {
        return (alias_map, value_map);
    };
    for (i, sink_column) in mapping_columns.iter().enumerate() {
        let Some(item) = select.projection.get(i) else {
            break;
        };
        let Some(output_expr) = ast::projection_expr(item) else {
            continue;
        };
        let alias = ast::projection_name(item).unwrap_or_else(|| sink_column.clone());
        alias_map.insert(
            sink_column.clone(),
            Expr::Identifier(Ident::new(alias)),
        );
        value_map.insert(sink_column.clone(), output_expr.clone());
    }
    (alias_map, value_map)
}
