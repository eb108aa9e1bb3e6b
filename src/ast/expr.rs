//! Expression-level traversal utilities
//!
//! Column-reference collection, aggregate detection, and targeted in-place
//! rewrites. All traversal goes through the sqlparser visitor so new
//! expression variants are handled structurally rather than by exhaustive
//! matching here.

use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, Query, Select, Visit,
    VisitMut, Visitor, VisitorMut,
};
use std::collections::BTreeMap;
use std::ops::ControlFlow;

/// Function names DuckDB treats as aggregates. Window invocations (with an
/// OVER clause) are not aggregates for rewriting purposes.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "any_value",
    "approx_count_distinct",
    "approx_distinct",
    "approx_quantile",
    "arbitrary",
    "arg_max",
    "arg_min",
    "array_agg",
    "avg",
    "bit_and",
    "bit_or",
    "bit_xor",
    "bool_and",
    "bool_or",
    "corr",
    "count",
    "count_if",
    "countif",
    "covar_pop",
    "covar_samp",
    "entropy",
    "favg",
    "first",
    "fsum",
    "group_concat",
    "histogram",
    "kurtosis",
    "last",
    "list",
    "listagg",
    "mad",
    "max",
    "max_by",
    "median",
    "min",
    "min_by",
    "mode",
    "product",
    "quantile",
    "quantile_cont",
    "quantile_disc",
    "regr_avgx",
    "regr_avgy",
    "regr_count",
    "regr_intercept",
    "regr_r2",
    "regr_slope",
    "regr_sxx",
    "regr_sxy",
    "regr_syy",
    "skewness",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "string_agg",
    "sum",
    "var_pop",
    "var_samp",
    "variance",
];

pub fn is_aggregate_function_name(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.binary_search(&name).is_ok()
}

/// Lowercased bare name of a function call.
pub fn function_name(func: &Function) -> String {
    func.name
        .0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

/// True for a non-windowed aggregate function call.
pub fn is_aggregate_call(func: &Function) -> bool {
    func.over.is_none() && is_aggregate_function_name(&function_name(func))
}

/// A single column reference found in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOccurrence {
    /// Lowercased qualifying table/alias, `None` for bare columns.
    pub table: Option<String>,
    /// Column name with original casing.
    pub column: String,
    /// Whether the reference sits inside an aggregate function call.
    pub in_aggregate: bool,
}

impl ColumnOccurrence {
    pub fn column_lower(&self) -> String {
        self.column.to_lowercase()
    }
}

struct ColumnCollector {
    occurrences: Vec<ColumnOccurrence>,
    agg_depth: usize,
}

impl Visitor for ColumnCollector {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        match expr {
            Expr::Identifier(ident) => self.occurrences.push(ColumnOccurrence {
                table: None,
                column: ident.value.clone(),
                in_aggregate: self.agg_depth > 0,
            }),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let table = parts[parts.len() - 2].value.to_lowercase();
                let column = parts[parts.len() - 1].value.clone();
                self.occurrences.push(ColumnOccurrence {
                    table: Some(table),
                    column,
                    in_aggregate: self.agg_depth > 0,
                });
            }
            Expr::Function(func) if is_aggregate_call(func) => self.agg_depth += 1,
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::Function(func) = expr
            && is_aggregate_call(func)
        {
            self.agg_depth -= 1;
        }
        ControlFlow::Continue(())
    }
}

/// Every column reference in the expression, in traversal order.
pub fn collect_columns(expr: &Expr) -> Vec<ColumnOccurrence> {
    let mut collector = ColumnCollector {
        occurrences: Vec::new(),
        agg_depth: 0,
    };
    let _ = Visit::visit(expr, &mut collector);
    collector.occurrences
}

/// Distinct column names (lowercased) the expression references from the
/// given table, in first-occurrence order.
pub fn columns_of_table(expr: &Expr, table: &str) -> Vec<String> {
    let table = table.to_lowercase();
    let mut seen = Vec::new();
    for occ in collect_columns(expr) {
        if occ.table.as_deref() == Some(table.as_str()) {
            let lower = occ.column_lower();
            if !seen.contains(&lower) {
                seen.push(lower);
            }
        }
    }
    seen
}

struct AggregateProbe {
    query_depth: usize,
    found: bool,
}

impl Visitor for AggregateProbe {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        self.query_depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if self.query_depth == 0
            && let Expr::Function(func) = expr
            && is_aggregate_call(func)
        {
            self.found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

/// Whether the expression contains an aggregate call outside of any nested
/// subquery.
pub fn contains_aggregate(expr: &Expr) -> bool {
    let mut probe = AggregateProbe {
        query_depth: 0,
        found: false,
    };
    let _ = Visit::visit(expr, &mut probe);
    probe.found
}

/// Whether any projection item of the SELECT contains an aggregate call.
/// This is what decides HAVING-style vs WHERE-style rewriting.
pub fn projection_has_aggregate(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        crate::ast::projection_expr(item)
            .map(contains_aggregate)
            .unwrap_or(false)
    })
}

struct AggregateCollector {
    aggregates: Vec<Function>,
    agg_depth: usize,
}

impl Visitor for AggregateCollector {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::Function(func) = expr
            && is_aggregate_call(func)
        {
            if self.agg_depth == 0 {
                self.aggregates.push(func.clone());
            }
            self.agg_depth += 1;
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::Function(func) = expr
            && is_aggregate_call(func)
        {
            self.agg_depth -= 1;
        }
        ControlFlow::Continue(())
    }
}

/// Outermost aggregate calls in the expression (nested aggregates stay
/// inside their enclosing call), cloned, in traversal order.
pub fn collect_aggregates(expr: &Expr) -> Vec<Function> {
    let mut collector = AggregateCollector {
        aggregates: Vec::new(),
        agg_depth: 0,
    };
    let _ = Visit::visit(expr, &mut collector);
    collector.aggregates
}

/// Unnamed positional argument expressions of a function call.
pub fn function_arg_exprs(func: &Function) -> Vec<&Expr> {
    let mut out = Vec::new();
    if let FunctionArguments::List(list) = &func.args {
        for arg in &list.args {
            if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg {
                out.push(expr);
            }
        }
    }
    out
}

struct AggregateRewriter<'a, E> {
    rewrite: &'a mut dyn FnMut(&Function) -> Result<Option<Expr>, E>,
    error: Option<E>,
    query_depth: usize,
}

impl<E> VisitorMut for AggregateRewriter<'_, E> {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<()> {
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<()> {
        self.query_depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<()> {
        if self.query_depth == 0
            && let Expr::Function(func) = expr
            && is_aggregate_call(func)
        {
            match (self.rewrite)(func) {
                Ok(Some(replacement)) => {
                    *expr = replacement;
                }
                Ok(None) => {}
                Err(e) => {
                    self.error = Some(e);
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Replace aggregate calls in place, skipping calls inside nested
/// subqueries (they evaluate in their own scope). The callback returns the
/// replacement expression, or `None` to leave the call untouched. Only the
/// replacement's children are traversed afterwards, so a nested aggregate
/// inside a replaced call's argument survives one pass; callers that must
/// eliminate every aggregate iterate to a fixpoint.
pub fn replace_aggregates<E>(
    expr: &mut Expr,
    mut rewrite: impl FnMut(&Function) -> Result<Option<Expr>, E>,
) -> Result<(), E> {
    let mut visitor = AggregateRewriter {
        rewrite: &mut rewrite,
        error: None,
        query_depth: 0,
    };
    let _ = VisitMut::visit(expr, &mut visitor);
    match visitor.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct TableQualifierRewriter<'a> {
    map: &'a BTreeMap<String, String>,
}

impl VisitorMut for TableQualifierRewriter<'_> {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<()> {
        if let Expr::CompoundIdentifier(parts) = expr
            && parts.len() >= 2
        {
            let idx = parts.len() - 2;
            let table = parts[idx].value.to_lowercase();
            if let Some(alias) = self.map.get(&table) {
                parts[idx] = Ident::new(alias.clone());
                // A schema prefix no longer applies once the reference
                // points at a derived-table alias.
                if parts.len() > 2 {
                    let tail = parts.split_off(idx);
                    *parts = tail;
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Rewrite `table.col` qualifiers according to `map` (lowercased table name
/// to replacement alias), including references inside aggregate calls.
pub fn rewrite_column_tables(expr: &mut Expr, map: &BTreeMap<String, String>) {
    if map.is_empty() {
        return;
    }
    let mut visitor = TableQualifierRewriter { map };
    let _ = VisitMut::visit(expr, &mut visitor);
}

struct ColumnSubstituter<'a> {
    resolve: &'a dyn Fn(Option<&str>, &str) -> Option<Expr>,
}

impl VisitorMut for ColumnSubstituter<'_> {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<()> {
        let resolved = match expr {
            Expr::Identifier(ident) => (self.resolve)(None, &ident.value),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let table = parts[parts.len() - 2].value.to_lowercase();
                let column = parts[parts.len() - 1].value.clone();
                (self.resolve)(Some(&table), &column)
            }
            _ => None,
        };
        if let Some(replacement) = resolved {
            *expr = replacement;
        }
        ControlFlow::Continue(())
    }
}

/// Replace whole column references with expressions chosen by `resolve`.
/// Used to substitute sink-column references with SELECT output expressions
/// in INSERT rewrites.
pub fn substitute_columns(expr: &mut Expr, resolve: impl Fn(Option<&str>, &str) -> Option<Expr>) {
    let mut visitor = ColumnSubstituter { resolve: &resolve };
    let _ = VisitMut::visit(expr, &mut visitor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{parse_expr, to_sql};

    #[test]
    fn aggregate_table_is_sorted_for_binary_search() {
        let mut sorted = AGGREGATE_FUNCTIONS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, AGGREGATE_FUNCTIONS);
    }

    #[test]
    fn collect_columns_tracks_qualification_and_aggregation() {
        let expr = parse_expr("max(foo.id) > bar.threshold AND baz > 1").unwrap();
        let cols = collect_columns(&expr);
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].table.as_deref(), Some("foo"));
        assert!(cols[0].in_aggregate);
        assert_eq!(cols[1].table.as_deref(), Some("bar"));
        assert!(!cols[1].in_aggregate);
        assert_eq!(cols[2].table, None);
        assert_eq!(cols[2].column, "baz");
    }

    #[test]
    fn contains_aggregate_ignores_subqueries_and_windows() {
        let plain = parse_expr("max(foo.id) > 1").unwrap();
        assert!(contains_aggregate(&plain));

        let nested_only = parse_expr("foo.id IN (SELECT max(x) FROM baz)").unwrap();
        assert!(!contains_aggregate(&nested_only));

        let windowed = parse_expr("sum(foo.id) OVER () > 1").unwrap();
        assert!(!contains_aggregate(&windowed));
    }

    #[test]
    fn collect_aggregates_keeps_nesting_inside_outermost() {
        let expr = parse_expr("max(sum(foo.amount)) > 500 AND count(*) > 0").unwrap();
        let aggs = collect_aggregates(&expr);
        assert_eq!(aggs.len(), 2);
        assert_eq!(function_name(&aggs[0]), "max");
        assert_eq!(function_name(&aggs[1]), "count");
    }

    #[test]
    fn rewrite_column_tables_reaches_into_aggregates() {
        let mut expr = parse_expr("max(foo.id) > 1 AND foo.name = 'x'").unwrap();
        let map = BTreeMap::from([("foo".to_string(), "sub".to_string())]);
        rewrite_column_tables(&mut expr, &map);
        assert_eq!(to_sql(&expr), "max(sub.id) > 1 AND sub.name = 'x'");
    }

    #[test]
    fn substitute_columns_replaces_whole_references() {
        let mut expr = parse_expr("reports.status = 'approved'").unwrap();
        substitute_columns(&mut expr, |table, column| {
            if table == Some("reports") && column.eq_ignore_ascii_case("status") {
                Some(parse_expr("'pending'").unwrap())
            } else {
                None
            }
        });
        assert_eq!(to_sql(&expr), "'pending' = 'approved'");
    }
}
