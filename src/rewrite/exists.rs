//! EXISTS-only source rewriting
//!
//! A policy source referenced only inside `EXISTS (…)` is invisible to the
//! outer WHERE/HAVING, so its constraint has nowhere to evaluate. The
//! policy-evaluation query is rewritten to join an aggregated derived table
//! instead:
//!
//! ```sql
//! WHERE … AND EXISTS (SELECT * FROM lineitem
//!                     WHERE l_orderkey = o_orderkey AND l_commitdate < l_receiptdate)
//! -- becomes
//! INNER JOIN (SELECT l_orderkey, max(l_quantity) AS agg_0
//!             FROM lineitem
//!             WHERE l_commitdate < l_receiptdate
//!             GROUP BY l_orderkey) AS exists_subquery
//!   ON l_orderkey = exists_subquery.l_orderkey  -- inner side re-qualified
//! ```
//!
//! and every constraint aggregate over the source is redirected at the
//! derived table's partial aggregate (`max(lineitem.l_quantity)` becomes
//! `max(exists_subquery.agg_0)`).

use crate::ast::{self, expr};
use crate::catalog::TableSchema;
use crate::rewrite::RewriteError;
use sqlparser::ast::{Expr, Function, Query, Select};
use std::collections::BTreeMap;

const DERIVED_ALIAS: &str = "exists_subquery";

/// Rewrite `policy_eval`'s EXISTS over `source` into an inner join, and
/// return the aggregate substitution map (serialized aggregate call to its
/// derived-table form).
pub fn rewrite_exists_source(
    policy_eval: &mut Query,
    source: &str,
    source_schema: &TableSchema,
    constraint_aggregates: &[Function],
) -> Result<BTreeMap<String, Expr>, RewriteError> {
    let select = ast::query_select_mut(policy_eval).ok_or_else(|| {
        RewriteError::Unsupported(format!(
            "policy source '{source}' is only reachable through a subquery of a non-SELECT query"
        ))
    })?;

    let (exists_subquery, remaining) = detach_exists_conjunct(select, source)?;
    select.selection = ast::conjoin(remaining);

    let inner_select = ast::query_select(&exists_subquery).ok_or_else(|| {
        RewriteError::Unsupported(format!(
            "EXISTS subquery over '{source}' is not a plain SELECT"
        ))
    })?;
    let inner_tables = ast::tables_in_from(inner_select);
    let inner_alias = inner_tables
        .iter()
        .find(|t| t.name == source)
        .and_then(|t| t.alias.clone());

    // Split the subquery WHERE into conjuncts local to the source table and
    // correlated ones referencing the outer scope.
    let mut local = Vec::new();
    let mut correlated = Vec::new();
    if let Some(selection) = &inner_select.selection {
        for conjunct in ast::split_conjuncts(selection) {
            if is_local_conjunct(conjunct, source, inner_alias.as_deref(), source_schema) {
                local.push((*conjunct).clone());
            } else {
                correlated.push((*conjunct).clone());
            }
        }
    }

    // Inner-side columns of the correlated conjuncts become the derived
    // table's grouping keys.
    let mut key_columns: Vec<String> = Vec::new();
    for conjunct in &correlated {
        for occ in expr::collect_columns(conjunct) {
            if is_inner_column(&occ, source, inner_alias.as_deref(), source_schema) {
                let lower = occ.column_lower();
                if !key_columns.contains(&lower) {
                    key_columns.push(lower);
                }
            }
        }
    }

    // Partial aggregates the constraints need, one output column each.
    let mut aggregate_map = BTreeMap::new();
    let mut agg_outputs: Vec<String> = Vec::new();
    for func in constraint_aggregates {
        let func_expr = Expr::Function(func.clone());
        if expr::columns_of_table(&func_expr, source).is_empty() {
            continue;
        }
        let key = ast::to_sql(&func_expr);
        if aggregate_map.contains_key(&key) {
            continue;
        }
        let idx = agg_outputs.len();
        // Inside the derived table the source may carry an alias; the
        // constraint always uses the bare table name.
        let mut derived_agg = func_expr.clone();
        if let Some(alias) = &inner_alias {
            let requalify = BTreeMap::from([(source.to_string(), alias.clone())]);
            expr::rewrite_column_tables(&mut derived_agg, &requalify);
        }
        agg_outputs.push(format!("{} AS agg_{idx}", ast::to_sql(&derived_agg)));
        let replacement = ast::parse_expr(&format!(
            "{}({DERIVED_ALIAS}.agg_{idx})",
            expr::function_name(func)
        ))?;
        aggregate_map.insert(key, replacement);
    }

    // Assemble the derived table.
    let mut projection: Vec<String> = key_columns.clone();
    projection.extend(agg_outputs);
    let mut derived_sql = format!("SELECT {} FROM {}", projection.join(", "), source);
    if let Some(alias) = &inner_alias {
        derived_sql = format!(
            "SELECT {} FROM {} AS {}",
            projection.join(", "),
            source,
            alias
        );
    }
    if let Some(filter) = ast::conjoin(local.clone()) {
        derived_sql.push_str(&format!(" WHERE {}", ast::to_sql(&filter)));
    }
    if !key_columns.is_empty() {
        derived_sql.push_str(&format!(" GROUP BY {}", key_columns.join(", ")));
    }

    // Join condition: the correlated conjuncts with inner columns pointed
    // at the derived table.
    let mut on_parts = Vec::new();
    for conjunct in &correlated {
        let mut requalified = conjunct.clone();
        expr::substitute_columns(&mut requalified, |table, column| {
            let occ = expr::ColumnOccurrence {
                table: table.map(|t| t.to_string()),
                column: column.to_string(),
                in_aggregate: false,
            };
            if is_inner_column(&occ, source, inner_alias.as_deref(), source_schema) {
                Some(
                    ast::parse_expr(&format!("{DERIVED_ALIAS}.{column}"))
                        .expect("qualified column parses"),
                )
            } else {
                None
            }
        });
        on_parts.push(requalified);
    }
    let on_sql = match ast::conjoin(on_parts) {
        Some(cond) => ast::to_sql(&cond),
        None => "TRUE".to_string(),
    };

    // Parse a join template and graft it onto the policy-eval FROM clause;
    // building parser structs by hand is the facade's job, not ours.
    let template = format!(
        "SELECT * FROM __dfc_placeholder INNER JOIN ({derived_sql}) AS {DERIVED_ALIAS} ON {on_sql}"
    );
    let template_stmt = ast::parse_statement(&template)?;
    let template_query = ast::statement_query(&template_stmt).expect("template is a query");
    let template_select = ast::query_select(template_query).expect("template is a select");
    let join = template_select.from[0].joins[0].clone();

    if select.from.is_empty() {
        return Err(RewriteError::Unsupported(format!(
            "cannot join EXISTS source '{source}' into a FROM-less query"
        )));
    }
    select.from[0].joins.push(join);

    Ok(aggregate_map)
}

/// Pull out the first `EXISTS (…)` conjunct whose subquery reads `source`,
/// returning it and the remaining conjuncts.
fn detach_exists_conjunct(
    select: &mut Select,
    source: &str,
) -> Result<(Query, Vec<Expr>), RewriteError> {
    let selection = select.selection.take().ok_or_else(|| {
        RewriteError::Unsupported(format!(
            "policy source '{source}' is not reachable from the query's FROM clause"
        ))
    })?;
    let conjuncts: Vec<Expr> = ast::split_conjuncts(&selection)
        .into_iter()
        .cloned()
        .collect();

    let mut exists_query = None;
    let mut remaining = Vec::new();
    for conjunct in conjuncts {
        if exists_query.is_none()
            && let Expr::Exists {
                subquery,
                negated: false,
            } = &conjunct
            && ast::query_select(subquery)
                .map(|inner| ast::tables_in_from(inner).iter().any(|t| t.name == source))
                .unwrap_or(false)
        {
            exists_query = Some(subquery.as_ref().clone());
            continue;
        }
        remaining.push(conjunct);
    }

    match exists_query {
        Some(query) => Ok((query, remaining)),
        None => {
            // Put the WHERE back together before failing.
            select.selection = ast::conjoin(remaining);
            Err(RewriteError::Unsupported(format!(
                "policy source '{source}' is only referenced outside FROM and not via EXISTS"
            )))
        }
    }
}

/// A conjunct is local when every column it references belongs to the
/// source table (by qualifier, or unqualified and present in its schema).
fn is_local_conjunct(
    conjunct: &Expr,
    source: &str,
    inner_alias: Option<&str>,
    schema: &TableSchema,
) -> bool {
    expr::collect_columns(conjunct)
        .iter()
        .all(|occ| is_inner_column(occ, source, inner_alias, schema))
}

fn is_inner_column(
    occ: &expr::ColumnOccurrence,
    source: &str,
    inner_alias: Option<&str>,
    schema: &TableSchema,
) -> bool {
    match occ.table.as_deref() {
        Some(table) => table == source || Some(table) == inner_alias,
        None => schema.has_column(&occ.column_lower()),
    }
}
