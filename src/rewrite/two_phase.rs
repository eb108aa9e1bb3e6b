//! Two-phase plan emission
//!
//! The canonical rewrite keeps the base query untouched inside a
//! `base_query` CTE and evaluates policies in a sibling `policy_eval` CTE
//! over the same FROM/JOIN, re-associating verdicts with base rows through
//! a stable key:
//!
//! - aggregation without GROUP BY: constant key `1 AS __dfc_two_phase_key`,
//!   CROSS JOIN of two single-group results;
//! - aggregation with GROUP BY: the grouping expressions, joined column by
//!   column;
//! - scans over a single plain table: the engine rowid as `__dfc_rowid`;
//! - other scans: the base projection's named outputs, with `policy_eval`
//!   deduplicated via SELECT DISTINCT.
//!
//! LIMIT-bearing statements wrap the joined result in a `__dfc_limited` CTE
//! so the limit applies before policy filtering.

use crate::ast;
use crate::rewrite::constraint::{Mode, PolicyClauses};
use crate::rewrite::RewriteError;
use sqlparser::ast::{Distinct, Expr, Ident, Query};

pub const ROWID_COLUMN: &str = "__dfc_rowid";
pub const TWO_PHASE_KEY: &str = "__dfc_two_phase_key";
pub const KEEP_FLAG: &str = "__dfc_keep";
pub const LIMITED_CTE: &str = "__dfc_limited";

/// How base rows and policy verdicts are re-associated.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinKeys {
    /// Single-group aggregation: constant key, CROSS JOIN.
    Cross,
    /// Scan over one plain table: engine rowid.
    RowId,
    /// Named key columns (GROUP BY keys or base projection outputs).
    Named(Vec<(String, Expr)>),
}

/// Pick keys for an aggregation rewrite. `None` means a key expression has
/// no usable output name and the caller must fall back to one-phase.
pub fn aggregation_keys(query: &Query) -> Option<JoinKeys> {
    let select = ast::query_select(query)?;
    if ast::group_by_is_all(select) {
        return None;
    }
    let group_exprs = ast::group_by_exprs(select);
    if group_exprs.is_empty() {
        return Some(JoinKeys::Cross);
    }
    let mut keys = Vec::new();
    for expr in group_exprs {
        let (name, key_expr) = match expr {
            Expr::Identifier(ident) => (ident.value.to_lowercase(), expr.clone()),
            Expr::CompoundIdentifier(parts) => {
                (parts.last()?.value.to_lowercase(), expr.clone())
            }
            // GROUP BY <ordinal> refers to a projection item.
            Expr::Value(value) => {
                let ordinal: usize = ast::to_sql(value).parse().ok()?;
                let item = select.projection.get(ordinal.checked_sub(1)?)?;
                let name = ast::projection_name(item)?;
                (name, ast::projection_expr(item)?.clone())
            }
            _ => return None,
        };
        keys.push((name, key_expr));
    }
    Some(JoinKeys::Named(keys))
}

/// Pick keys for a scan rewrite.
pub fn scan_keys(query: &Query) -> Option<JoinKeys> {
    let select = ast::query_select(query)?;
    if ast::single_plain_table(select) && !ast::is_distinct(select) {
        return Some(JoinKeys::RowId);
    }
    let mut keys = Vec::new();
    for item in &select.projection {
        let name = ast::projection_name(item)?;
        let expr = ast::projection_expr(item)?.clone();
        keys.push((name, expr));
    }
    if keys.is_empty() {
        return None;
    }
    Some(JoinKeys::Named(keys))
}

/// Clone of the original query with ORDER BY/LIMIT dropped, ready to become
/// `policy_eval`.
pub fn policy_eval_skeleton(original: &Query) -> Query {
    let mut eval = original.clone();
    ast::strip_trailing_clauses(&mut eval);
    eval
}

/// Replace the skeleton's projection with the join key and any
/// INVALIDATE/flag columns, and attach filter clauses.
///
/// `filters_as_flag` projects the filter conjunction as a boolean column
/// instead of a WHERE/HAVING clause (the LIMIT-bearing shape).
pub fn finish_policy_eval(
    eval: &mut Query,
    keys: &JoinKeys,
    clauses: &PolicyClauses,
    mode: Mode,
    filters_as_flag: bool,
) -> Result<(), RewriteError> {
    let select = ast::query_select_mut(eval).ok_or_else(|| {
        RewriteError::Unsupported("policy evaluation needs a SELECT body".to_string())
    })?;

    select.projection.clear();
    match keys {
        JoinKeys::Cross => {
            ast::push_aliased_projection(select, ast::parse_expr("1")?, TWO_PHASE_KEY);
        }
        JoinKeys::RowId => {
            ast::push_aliased_projection(
                select,
                Expr::Identifier(Ident::new("rowid")),
                ROWID_COLUMN,
            );
        }
        JoinKeys::Named(named) => {
            for (name, expr) in named {
                ast::push_aliased_projection(select, expr.clone(), name);
            }
            if mode == Mode::Scan {
                select.distinct = Some(Distinct::Distinct);
            }
        }
    }

    if let Some(valid) = clauses.valid_expr() {
        ast::push_aliased_projection(select, valid, "valid");
    }
    if let Some(message) = clauses.message_expr() {
        ast::push_aliased_projection(select, message, "message");
    }

    if let Some(filter) = ast::conjoin(clauses.filters.clone()) {
        if filters_as_flag {
            ast::push_aliased_projection(select, ast::parenthesize(filter), KEEP_FLAG);
        } else {
            match mode {
                Mode::Scan => ast::and_into_where(select, filter),
                Mode::Grouping => ast::and_into_having(select, filter),
            }
        }
    }

    Ok(())
}

fn join_clause(keys: &JoinKeys) -> String {
    match keys {
        JoinKeys::Cross => "CROSS JOIN policy_eval".to_string(),
        JoinKeys::RowId => format!(
            "JOIN policy_eval ON base_query.{ROWID_COLUMN} = policy_eval.{ROWID_COLUMN}"
        ),
        JoinKeys::Named(named) => {
            let conditions: Vec<String> = named
                .iter()
                .map(|(name, _)| format!("base_query.{name} = policy_eval.{name}"))
                .collect();
            format!("JOIN policy_eval ON {}", conditions.join(" AND "))
        }
    }
}

/// Assemble the plain (non-LIMIT) two-phase statement.
pub fn assemble(
    base: &Query,
    eval: &Query,
    keys: &JoinKeys,
    clauses: &PolicyClauses,
) -> Result<String, RewriteError> {
    let mut projection = match keys {
        JoinKeys::RowId => format!("base_query.* EXCLUDE ({ROWID_COLUMN})"),
        _ => "base_query.*".to_string(),
    };
    if !clauses.valids.is_empty() {
        projection.push_str(", policy_eval.valid AS valid");
    }
    if !clauses.messages.is_empty() {
        projection.push_str(", policy_eval.message AS message");
    }

    let sql = format!(
        "WITH base_query AS ({}), policy_eval AS ({}) SELECT {} FROM base_query {}",
        ast::to_sql(base),
        ast::to_sql(eval),
        projection,
        join_clause(keys)
    );
    ast::parse_statement(&sql)?;
    Ok(sql)
}

/// Assemble the LIMIT-bearing aggregation shape: base and policy results
/// are joined, ordered and limited inside `__dfc_limited`, then filtered by
/// the keep flag.
pub fn assemble_limited(
    base: &Query,
    eval: &Query,
    keys: &JoinKeys,
    clauses: &PolicyClauses,
    trailing: &[String],
) -> Result<String, RewriteError> {
    let has_flag = !clauses.filters.is_empty();
    let mut inner_projection = "base_query.*".to_string();
    if !clauses.valids.is_empty() {
        inner_projection.push_str(", policy_eval.valid AS valid");
    }
    if !clauses.messages.is_empty() {
        inner_projection.push_str(", policy_eval.message AS message");
    }
    if has_flag {
        inner_projection.push_str(&format!(", policy_eval.{KEEP_FLAG} AS {KEEP_FLAG}"));
    }

    let mut limited = format!(
        "SELECT {} FROM base_query {}",
        inner_projection,
        join_clause(keys)
    );
    for clause in trailing {
        limited.push(' ');
        limited.push_str(clause);
    }

    let outer = if has_flag {
        format!("SELECT * EXCLUDE ({KEEP_FLAG}) FROM {LIMITED_CTE} WHERE {KEEP_FLAG}")
    } else {
        format!("SELECT * FROM {LIMITED_CTE}")
    };

    let sql = format!(
        "WITH base_query AS ({}), policy_eval AS ({}), {LIMITED_CTE} AS ({}) {}",
        ast::to_sql(base),
        ast::to_sql(eval),
        limited,
        outer
    );
    ast::parse_statement(&sql)?;
    Ok(sql)
}

/// Assemble the LIMIT-bearing scan shape: flag and INVALIDATE columns are
/// computed inline, the original ORDER BY/LIMIT stays inside the CTE, and
/// the outer query filters by the flag.
pub fn assemble_limited_scan(
    work: &mut Query,
    clauses: &PolicyClauses,
) -> Result<String, RewriteError> {
    let select = ast::query_select_mut(work).ok_or_else(|| {
        RewriteError::Unsupported("LIMIT rewrite needs a SELECT body".to_string())
    })?;

    let has_flag = !clauses.filters.is_empty();
    if let Some(valid) = clauses.valid_expr() {
        ast::push_aliased_projection(select, valid, "valid");
    }
    if let Some(message) = clauses.message_expr() {
        ast::push_aliased_projection(select, message, "message");
    }
    if let Some(filter) = ast::conjoin(clauses.filters.clone()) {
        ast::push_aliased_projection(select, ast::parenthesize(filter), KEEP_FLAG);
    }

    let outer = if has_flag {
        format!("SELECT * EXCLUDE ({KEEP_FLAG}) FROM {LIMITED_CTE} WHERE {KEEP_FLAG}")
    } else {
        format!("SELECT * FROM {LIMITED_CTE}")
    };
    let sql = format!("WITH {LIMITED_CTE} AS ({}) {}", ast::to_sql(work), outer);
    ast::parse_statement(&sql)?;
    Ok(sql)
}

/// Append `rowid AS __dfc_rowid` to the base projection.
pub fn add_rowid_to_base(base: &mut Query) -> Result<(), RewriteError> {
    let select = ast::query_select_mut(base).ok_or_else(|| {
        RewriteError::Unsupported("rowid key needs a SELECT body".to_string())
    })?;
    ast::push_aliased_projection(select, Expr::Identifier(Ident::new("rowid")), ROWID_COLUMN);
    Ok(())
}
