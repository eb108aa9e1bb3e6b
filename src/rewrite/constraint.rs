//! Constraint transformation and action binding
//!
//! Turns each matching policy's constraint into the SQL fragment its action
//! needs: a filter conjunct (REMOVE, and the CASE-wrapped KILL/HUMAN/LLM
//! forms), a `valid` projection (INVALIDATE), or both a `valid` and a
//! `message` projection (INVALIDATE_MESSAGE). Scan-mode clauses are
//! aggregate-lowered; grouping-mode clauses keep their aggregates for
//! HAVING.

use crate::ast::{self, expr};
use crate::policy::{lowering, Action, Policy};
use crate::rewrite::RewriteError;
use sqlparser::ast::Expr;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Per-row evaluation: aggregates are lowered, clauses land in WHERE.
    Scan,
    /// Group evaluation: aggregates stay put, clauses land in HAVING.
    Grouping,
}

/// The fragments produced for one statement's worth of matching policies,
/// in registration order within each class.
#[derive(Debug, Default)]
pub struct PolicyClauses {
    /// Conjuncts that must hold for a row/group to survive.
    pub filters: Vec<Expr>,
    /// Constraint expressions surfaced as the `valid` column.
    pub valids: Vec<Expr>,
    /// Per-policy message expressions (NULL when the policy passes).
    pub messages: Vec<Expr>,
}

impl PolicyClauses {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.valids.is_empty()
    }

    /// The combined `valid` expression: conjunction of every invalidating
    /// policy's constraint.
    pub fn valid_expr(&self) -> Option<Expr> {
        ast::conjoin(self.valids.clone())
    }

    /// The combined `message` expression: failing policies' messages joined
    /// with `; `, NULL when everything passes.
    pub fn message_expr(&self) -> Option<Expr> {
        if self.messages.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.messages.iter().map(ast::to_sql).collect();
        let sql = format!("NULLIF(CONCAT_WS('; ', {}), '')", parts.join(", "));
        Some(ast::parse_expr(&sql).expect("message template parses"))
    }
}

pub struct ClauseBuilder<'a> {
    pub mode: Mode,
    /// Source table -> derived-table/CTE alias substitutions.
    pub table_map: &'a BTreeMap<String, String>,
    /// Serialized aggregate call -> replacement (EXISTS rewrites).
    pub aggregate_map: &'a BTreeMap<String, Expr>,
    /// Sink column substitutions for INSERT contexts (lowercased column ->
    /// SELECT output expression).
    pub sink_map: &'a BTreeMap<String, Expr>,
    /// Lowercased sink table name the sink substitutions apply to.
    pub sink_table: Option<&'a str>,
    pub stream_file_path: &'a str,
}

impl ClauseBuilder<'_> {
    pub fn build(&self, policies: &[&Policy]) -> Result<PolicyClauses, RewriteError> {
        let mut clauses = PolicyClauses::default();
        for policy in policies {
            let clause = ast::parenthesize(self.clause_for(policy)?);
            match policy.action() {
                Action::Remove => clauses.filters.push(clause),
                Action::Kill => clauses.filters.push(ast::parenthesize(wrap_kill(&clause)?)),
                Action::Human | Action::Llm => clauses.filters.push(ast::parenthesize(
                    wrap_resolver(&clause, self.stream_file_path)?,
                )),
                Action::Invalidate => clauses.valids.push(clause),
                Action::InvalidateMessage => {
                    clauses.messages.push(message_for(policy, &clause)?);
                    clauses.valids.push(clause);
                }
            }
        }
        Ok(clauses)
    }

    /// The policy's constraint adapted to this statement: EXISTS-derived
    /// aggregate substitution, derived-table alias rewriting, sink-column
    /// substitution, then (in scan mode) aggregate lowering.
    fn clause_for(&self, policy: &Policy) -> Result<Expr, RewriteError> {
        let mut clause = policy.constraint_expr().clone();

        if !self.aggregate_map.is_empty() {
            expr::replace_aggregates(&mut clause, |func| {
                let key = ast::to_sql(&Expr::Function(func.clone()));
                Ok::<_, RewriteError>(self.aggregate_map.get(&key).cloned())
            })?;
        }

        expr::rewrite_column_tables(&mut clause, self.table_map);

        if let Some(sink) = self.sink_table
            && !self.sink_map.is_empty()
        {
            expr::substitute_columns(&mut clause, |table, column| {
                if table == Some(sink) {
                    self.sink_map.get(&column.to_lowercase()).cloned()
                } else {
                    None
                }
            });
        }

        if self.mode == Mode::Scan {
            clause = lowering::lower_aggregates(&clause)?;
        }
        Ok(clause)
    }
}

fn wrap_kill(clause: &Expr) -> Result<Expr, RewriteError> {
    Ok(ast::parse_expr(&format!(
        "CASE WHEN {} THEN TRUE ELSE kill() END",
        ast::to_sql(clause)
    ))?)
}

/// `CASE WHEN C THEN TRUE ELSE address_violating_rows(cols…, path) END`.
/// Column values are cast to VARCHAR (NULL rendered as 'NULL') so the
/// engine-side function sees a uniform signature.
fn wrap_resolver(clause: &Expr, stream_file_path: &str) -> Result<Expr, RewriteError> {
    let mut args: Vec<String> = Vec::new();
    let mut seen = Vec::new();
    for occ in expr::collect_columns(clause) {
        let Some(table) = occ.table else { continue };
        let key = (table.clone(), occ.column_lower());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        args.push(format!(
            "COALESCE(CAST({}.{} AS VARCHAR), 'NULL')",
            table, occ.column
        ));
    }
    args.push(format!("'{}'", stream_file_path.replace('\'', "''")));
    Ok(ast::parse_expr(&format!(
        "CASE WHEN {} THEN TRUE ELSE address_violating_rows({}) END",
        ast::to_sql(clause),
        args.join(", ")
    ))?)
}

fn message_for(policy: &Policy, clause: &Expr) -> Result<Expr, RewriteError> {
    let text = policy.description().unwrap_or(policy.constraint());
    Ok(ast::parse_expr(&format!(
        "CASE WHEN {} THEN NULL ELSE '{}' END",
        ast::to_sql(clause),
        text.replace('\'', "''")
    ))?)
}
