//! Aggregate-policy support
//!
//! Aggregate policies defer constraint evaluation until after a batch of
//! INSERTs: each constraint aggregate gets a `_{policy_id}_tmpN` sink
//! column holding its per-row (scan) or per-group (aggregation) input, and
//! `finalize` re-applies the aggregation over the whole sink.
//!
//! For a nested source aggregate `max(sum(bank_txn.amount))` the inner
//! `sum` is computed at INSERT time and the outer `max` at finalize; a
//! single-level aggregate is applied once at INSERT time (per group) and
//! once more at finalize over the partials, which is sound for the
//! idempotent-combine aggregates (MAX/MIN) and for SUM-of-partial-sums.

use crate::ast::{self, expr};
use crate::policy::{lowering, AggregatePolicy};
use crate::rewrite::constraint::Mode;
use crate::rewrite::RewriteError;
use sqlparser::ast::{Expr, Function};
use std::collections::BTreeMap;

/// The expressions to stash in temp columns at INSERT time, one per
/// constraint aggregate, in constraint traversal order.
pub fn insert_temp_exprs(
    policy: &AggregatePolicy,
    mode: Mode,
    sink_value_map: &BTreeMap<String, Expr>,
) -> Result<Vec<Expr>, RewriteError> {
    let sink = policy.sink_lower();
    let mut out = Vec::new();
    for func in expr::collect_aggregates(policy.constraint_expr()) {
        let mut call = Expr::Function(func.clone());
        if let Some(sink) = &sink {
            substitute_sink_columns(&mut call, sink, sink_value_map);
        }
        let temp = match mode {
            // Per-row input: lowering collapses the aggregate (and any
            // nested one) to its scalar form, folding FILTER into a CASE.
            Mode::Scan => lowering::lower_aggregates(&call)?,
            // Per-group input: keep the innermost aggregation level.
            Mode::Grouping => match nested_argument(&call) {
                Some(inner) => inner,
                None => call,
            },
        };
        out.push(temp);
    }
    Ok(out)
}

/// The SQL evaluated by `finalize_aggregate_policies` for one policy: the
/// constraint with each aggregate redirected at its temp column.
pub fn finalize_sql(policy: &AggregatePolicy) -> Result<String, RewriteError> {
    let sink = policy.sink().ok_or_else(|| {
        RewriteError::Unsupported(format!(
            "aggregate policy {} has no sink to finalize",
            policy.id()
        ))
    })?;

    let source = policy.source_lower();
    let mut constraint = policy.constraint_expr().clone();
    let mut n = 0usize;
    expr::replace_aggregates(&mut constraint, |func| {
        n += 1;
        finalize_replacement(policy, func, n, source.as_deref()).map(Some)
    })?;

    Ok(format!(
        "SELECT ({}) FROM {sink}",
        ast::to_sql(&constraint)
    ))
}

/// `agg(tmp_n)`, keeping the FILTER clause when it can still be evaluated
/// against the sink (source-side filters reference rows that no longer
/// exist at finalize time and are dropped).
fn finalize_replacement(
    policy: &AggregatePolicy,
    func: &Function,
    n: usize,
    source: Option<&str>,
) -> Result<Expr, RewriteError> {
    let temp = policy.temp_column(n);
    let name = expr::function_name(func);
    let mut sql = format!("{name}({temp})");

    let is_source_call = source.is_some_and(|s| {
        !expr::columns_of_table(&Expr::Function(func.clone()), s).is_empty()
    });
    if !is_source_call && let Some(filter) = &func.filter {
        sql.push_str(&format!(" FILTER (WHERE {})", ast::to_sql(filter.as_ref())));
    }
    Ok(ast::parse_expr(&sql)?)
}

/// The violation message reported when a finalize evaluation comes back
/// false.
pub fn violation_message(policy: &AggregatePolicy) -> String {
    match policy.description() {
        Some(description) => format!(
            "{description}: Aggregate policy constraint violated: {}",
            policy.constraint()
        ),
        None => format!(
            "Aggregate policy constraint violated: {}",
            policy.constraint()
        ),
    }
}

/// The argument expression of an aggregate call when it itself contains an
/// aggregate (the nested-source-aggregate case).
fn nested_argument(call: &Expr) -> Option<Expr> {
    let Expr::Function(func) = call else {
        return None;
    };
    let arg = expr::function_arg_exprs(func).first().cloned()?.clone();
    if expr::contains_aggregate(&arg) {
        Some(arg)
    } else {
        None
    }
}

/// Substitute sink-qualified columns (and the bare sink table name used as
/// a whole-row argument) with the SELECT output expressions feeding them.
fn substitute_sink_columns(call: &mut Expr, sink: &str, sink_value_map: &BTreeMap<String, Expr>) {
    expr::substitute_columns(call, |table, column| match table {
        Some(t) if t == sink => sink_value_map.get(&column.to_lowercase()).cloned(),
        _ => None,
    });
}
