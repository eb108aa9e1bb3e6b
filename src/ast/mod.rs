//! SQL AST facade
//!
//! All parsing, serialization, and raw `sqlparser` structure access lives
//! behind this module. The rewrite passes never build parser structs by
//! hand: synthesized SQL is produced by formatting templates and re-parsing
//! them here, and existing trees are edited through the accessors below.
//! This keeps the (fairly mobile) parser API surface in one place.

pub mod expr;

use sqlparser::ast::{
    Distinct, Expr, GroupByExpr, Ident, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use thiserror::Error;

const DIALECT: DuckDbDialect = DuckDbDialect {};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("SQL parse error: {0}")]
    Syntax(String),

    #[error("expected a single SQL statement, found {0}")]
    StatementCount(usize),

    #[error("trailing input after expression: {0}")]
    TrailingInput(String),
}

/// Parse a single statement in the DuckDB dialect.
pub fn parse_statement(sql: &str) -> Result<Statement, ParseError> {
    let mut statements =
        Parser::parse_sql(&DIALECT, sql).map_err(|e| ParseError::Syntax(e.to_string()))?;
    if statements.len() != 1 {
        return Err(ParseError::StatementCount(statements.len()));
    }
    Ok(statements.pop().expect("length checked"))
}

/// Parse a standalone scalar/boolean expression.
///
/// The whole input must be consumed: `a > 1 b` is rejected rather than
/// silently truncated to `a > 1`.
pub fn parse_expr(sql: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser::new(&DIALECT)
        .try_with_sql(sql)
        .map_err(|e| ParseError::Syntax(e.to_string()))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| ParseError::Syntax(e.to_string()))?;
    if parser.peek_token().token != Token::EOF {
        return Err(ParseError::TrailingInput(sql.to_string()));
    }
    Ok(expr)
}

/// Serialize any AST node back to SQL text.
pub fn to_sql<T: std::fmt::Display>(node: &T) -> String {
    node.to_string()
}

/// The query inside a statement, if it is a plain `SELECT`-shaped statement.
pub fn statement_query(stmt: &Statement) -> Option<&Query> {
    match stmt {
        Statement::Query(query) => Some(query),
        _ => None,
    }
}

pub fn statement_query_mut(stmt: &mut Statement) -> Option<&mut Query> {
    match stmt {
        Statement::Query(query) => Some(query),
        _ => None,
    }
}

/// The `SELECT` body of a query, when the query is not a set operation,
/// VALUES list, or other non-SELECT body.
pub fn query_select(query: &Query) -> Option<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Some(select),
        _ => None,
    }
}

pub fn query_select_mut(query: &mut Query) -> Option<&mut Select> {
    match query.body.as_mut() {
        SetExpr::Select(select) => Some(select),
        _ => None,
    }
}

/// A table reference appearing directly in a FROM/JOIN clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Lowercased table name (last path segment).
    pub name: String,
    /// Lowercased alias, when one is present.
    pub alias: Option<String>,
}

fn object_name_last(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

fn factor_table_ref(factor: &TableFactor) -> Option<TableRef> {
    match factor {
        TableFactor::Table { name, alias, .. } => Some(TableRef {
            name: object_name_last(name),
            alias: alias.as_ref().map(|a| a.name.value.to_lowercase()),
        }),
        _ => None,
    }
}

/// Plain tables named directly in this SELECT's FROM/JOIN clauses.
/// Does not descend into derived tables or subqueries.
pub fn tables_in_from(select: &Select) -> Vec<TableRef> {
    let mut tables = Vec::new();
    for twj in &select.from {
        if let Some(t) = factor_table_ref(&twj.relation) {
            tables.push(t);
        }
        for join in &twj.joins {
            if let Some(t) = factor_table_ref(&join.relation) {
                tables.push(t);
            }
        }
    }
    tables
}

/// Derived tables (`FROM (SELECT …) AS alias`) named directly in this
/// SELECT's FROM/JOIN clauses, with their aliases.
pub fn derived_tables_in_from_mut(select: &mut Select) -> Vec<(&mut Query, Option<String>)> {
    let mut derived = Vec::new();
    for twj in &mut select.from {
        collect_derived(&mut twj.relation, &mut derived);
        for join in &mut twj.joins {
            collect_derived(&mut join.relation, &mut derived);
        }
    }
    derived
}

fn collect_derived<'a>(
    factor: &'a mut TableFactor,
    out: &mut Vec<(&'a mut Query, Option<String>)>,
) {
    if let TableFactor::Derived {
        subquery, alias, ..
    } = factor
    {
        let alias_name = alias.as_ref().map(|a| a.name.value.to_lowercase());
        out.push((subquery.as_mut(), alias_name));
    }
}

/// Whether the query carries ORDER BY, LIMIT, or OFFSET at its top level.
pub fn has_limit(query: &Query) -> bool {
    query.limit.is_some() || query.offset.is_some()
}

/// Detach ORDER BY / LIMIT / OFFSET from the query, returning them as SQL
/// fragments (in clause order) for re-attachment elsewhere.
pub fn take_trailing_clauses(query: &mut Query) -> Vec<String> {
    let mut fragments = Vec::new();
    if let Some(order_by) = query.order_by.take() {
        let exprs: Vec<String> = order_by.exprs.iter().map(|e| e.to_string()).collect();
        if !exprs.is_empty() {
            fragments.push(format!("ORDER BY {}", exprs.join(", ")));
        }
    }
    if let Some(limit) = query.limit.take() {
        fragments.push(format!("LIMIT {limit}"));
    }
    if let Some(offset) = query.offset.take() {
        fragments.push(offset.to_string());
    }
    fragments
}

/// Drop ORDER BY / LIMIT / OFFSET without keeping them.
pub fn strip_trailing_clauses(query: &mut Query) {
    query.order_by = None;
    query.limit = None;
    query.limit_by.clear();
    query.offset = None;
}

pub fn is_distinct(select: &Select) -> bool {
    matches!(select.distinct, Some(Distinct::Distinct))
}

/// GROUP BY expressions, or an empty slice when the query has none.
pub fn group_by_exprs(select: &Select) -> &[Expr] {
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs,
        _ => &[],
    }
}

pub fn has_group_by(select: &Select) -> bool {
    !group_by_exprs(select).is_empty()
}

/// `GROUP BY ALL`: the grouping key set is implicit, so key-based plans
/// cannot name it.
pub fn group_by_is_all(select: &Select) -> bool {
    matches!(&select.group_by, GroupByExpr::All(_))
}

/// The output name of a projection item: the alias when present, the column
/// name for a bare column reference, `None` for anything else (wildcards,
/// unnamed expressions).
pub fn projection_name(item: &SelectItem) -> Option<String> {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.to_lowercase()),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
            parts.last().map(|i| i.value.to_lowercase())
        }
        _ => None,
    }
}

pub fn projection_expr(item: &SelectItem) -> Option<&Expr> {
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
        _ => None,
    }
}

pub fn has_wildcard_projection(select: &Select) -> bool {
    select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)))
}

/// Append `expr AS alias` to the projection.
pub fn push_aliased_projection(select: &mut Select, expr: Expr, alias: &str) {
    select.projection.push(SelectItem::ExprWithAlias {
        expr,
        alias: Ident::new(alias),
    });
}

pub fn push_projection(select: &mut Select, expr: Expr) {
    select.projection.push(SelectItem::UnnamedExpr(expr));
}

/// AND an additional (already parenthesized) conjunct into the WHERE clause.
/// The pre-existing clause is wrapped in parentheses so operator precedence
/// survives serialization.
pub fn and_into_where(select: &mut Select, conjunct: Expr) {
    select.selection = Some(combine_and(select.selection.take(), conjunct));
}

/// AND an additional conjunct into the HAVING clause.
pub fn and_into_having(select: &mut Select, conjunct: Expr) {
    select.having = Some(combine_and(select.having.take(), conjunct));
}

fn combine_and(existing: Option<Expr>, conjunct: Expr) -> Expr {
    match existing {
        None => conjunct,
        Some(prior) => Expr::BinaryOp {
            left: Box::new(parenthesize(prior)),
            op: sqlparser::ast::BinaryOperator::And,
            right: Box::new(conjunct),
        },
    }
}

/// Wrap an expression in parentheses unless it already is.
pub fn parenthesize(expr: Expr) -> Expr {
    match expr {
        Expr::Nested(_) => expr,
        other => Expr::Nested(Box::new(other)),
    }
}

/// Combine expressions with AND, each operand parenthesized.
pub fn conjoin(exprs: Vec<Expr>) -> Option<Expr> {
    let mut iter = exprs.into_iter();
    let first = parenthesize(iter.next()?);
    Some(iter.fold(first, |acc, e| Expr::BinaryOp {
        left: Box::new(acc),
        op: sqlparser::ast::BinaryOperator::And,
        right: Box::new(parenthesize(e)),
    }))
}

/// Split a conjunction into its top-level AND operands.
pub fn split_conjuncts(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
        match expr {
            Expr::BinaryOp {
                left,
                op: sqlparser::ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::Nested(inner) => walk(inner, out),
            other => out.push(other),
        }
    }
    walk(expr, &mut out);
    out
}

/// All table names referenced in FROM/JOIN position anywhere inside the
/// query, including subqueries and CTE bodies. CTE aliases referenced in a
/// FROM clause are included as well, mirroring how matching treats them.
pub fn all_relation_names(query: &Query) -> std::collections::BTreeSet<String> {
    use std::ops::ControlFlow;
    let mut names = std::collections::BTreeSet::new();
    let _ = sqlparser::ast::visit_relations(query, |relation| {
        names.insert(object_name_last(relation));
        ControlFlow::<()>::Continue(())
    });
    names
}

/// True when the FROM clause is exactly one plain (non-derived) table with
/// no joins, the only shape where the engine's `rowid` pseudo-column is
/// unambiguous.
pub fn single_plain_table(select: &Select) -> bool {
    if select.from.len() != 1 {
        return false;
    }
    let twj: &TableWithJoins = &select.from[0];
    twj.joins.is_empty() && matches!(twj.relation, TableFactor::Table { .. })
}
