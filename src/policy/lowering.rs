//! Aggregate-to-scalar lowering
//!
//! Scan queries evaluate policy constraints per row, so aggregate calls in
//! a constraint are rewritten to the value they would take over a single
//! row:
//!
//! - count-like calls (`COUNT`, `COUNT(DISTINCT …)`, `APPROX_COUNT_DISTINCT`,
//!   `REGR_COUNT`) become the literal `1`;
//! - `COUNT_IF(p)` becomes `CASE WHEN p THEN 1 ELSE 0 END`;
//! - `ARRAY_AGG(x)` becomes the single-element array `[x]`;
//! - everything else (`MAX`, `SUM`, `AVG`, …) becomes its full argument
//!   expression, nested structure intact.
//!
//! A `FILTER (WHERE p)` clause folds into a CASE over the lowered argument.
//! Lowering is idempotent: applying it to an already-scalar expression is a
//! no-op.

use crate::ast::{self, expr, ParseError};
use sqlparser::ast::{Expr, Function};

/// Aggregates that count rows rather than combine values.
fn is_count_like(name: &str) -> bool {
    matches!(
        name,
        "count" | "approx_count_distinct" | "approx_distinct" | "regr_count"
    )
}

/// Lower every aggregate call in `constraint` to its single-row form.
/// Iterates to a fixpoint so nested aggregates (`max(sum(x))`) collapse
/// fully.
pub fn lower_aggregates(constraint: &Expr) -> Result<Expr, ParseError> {
    let mut lowered = constraint.clone();
    loop {
        let mut changed = false;
        expr::replace_aggregates(&mut lowered, |func| {
            changed = true;
            lower_call(func).map(Some)
        })?;
        if !changed || !expr::contains_aggregate(&lowered) {
            break;
        }
    }
    Ok(lowered)
}

fn lower_call(func: &Function) -> Result<Expr, ParseError> {
    let name = expr::function_name(func);
    let args = expr::function_arg_exprs(func);

    let base: Expr = if name == "count_if" || name == "countif" {
        match args.first() {
            Some(predicate) => ast::parse_expr(&format!(
                "CASE WHEN {} THEN 1 ELSE 0 END",
                ast::to_sql(*predicate)
            ))?,
            None => ast::parse_expr("1")?,
        }
    } else if is_count_like(&name) {
        ast::parse_expr("1")?
    } else if name == "array_agg" || name == "list" {
        match args.first() {
            Some(element) => ast::parse_expr(&format!("[{}]", ast::to_sql(*element)))?,
            None => ast::parse_expr("[NULL]")?,
        }
    } else {
        match args.first() {
            Some(inner) => (*inner).clone(),
            None => ast::parse_expr("1")?,
        }
    };

    match &func.filter {
        None => Ok(base),
        Some(predicate) => {
            // Neutral element so filtered-out rows contribute nothing:
            // 0 for counting/summing shapes, NULL otherwise.
            let neutral = if is_count_like(&name)
                || name == "count_if"
                || name == "countif"
                || name == "sum"
                || name == "fsum"
            {
                "0"
            } else {
                "NULL"
            };
            ast::parse_expr(&format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                ast::to_sql(predicate.as_ref()),
                ast::to_sql(&base),
                neutral
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{parse_expr, to_sql};

    fn lower(sql: &str) -> String {
        to_sql(&lower_aggregates(&parse_expr(sql).unwrap()).unwrap())
    }

    #[test]
    fn max_lowers_to_its_argument() {
        assert_eq!(lower("max(foo.id) > 10"), "foo.id > 10");
    }

    #[test]
    fn full_argument_expression_is_preserved() {
        assert_eq!(
            lower("sum(CASE WHEN foo.kind = 'a' THEN foo.amount ELSE 0 END) > 5"),
            "CASE WHEN foo.kind = 'a' THEN foo.amount ELSE 0 END > 5"
        );
    }

    #[test]
    fn count_star_lowers_to_one() {
        assert_eq!(lower("count(*) > 0"), "1 > 0");
    }

    #[test]
    fn count_distinct_lowers_to_one() {
        assert_eq!(lower("count(DISTINCT foo.id) > 1"), "1 > 1");
        assert_eq!(lower("approx_count_distinct(foo.id) > 1"), "1 > 1");
        assert_eq!(lower("regr_count(foo.id) > 0"), "1 > 0");
    }

    #[test]
    fn count_if_lowers_to_case() {
        assert_eq!(
            lower("count_if(foo.id > 2) > 0"),
            "CASE WHEN foo.id > 2 THEN 1 ELSE 0 END > 0"
        );
    }

    #[test]
    fn array_agg_lowers_to_singleton_array() {
        assert_eq!(lower("array_agg(foo.id) = [2]"), "[foo.id] = [2]");
    }

    #[test]
    fn filter_folds_into_case() {
        assert_eq!(
            lower("sum(foo.amount) FILTER (WHERE foo.kind = 'Income') > 4000"),
            "CASE WHEN foo.kind = 'Income' THEN foo.amount ELSE 0 END > 4000"
        );
        assert_eq!(
            lower("max(foo.amount) FILTER (WHERE foo.kind = 'Income') > 10"),
            "CASE WHEN foo.kind = 'Income' THEN foo.amount ELSE NULL END > 10"
        );
    }

    #[test]
    fn nested_aggregates_collapse_fully() {
        assert_eq!(lower("max(sum(foo.amount)) > 500"), "foo.amount > 500");
    }

    #[test]
    fn subquery_aggregates_are_untouched() {
        assert_eq!(
            lower("foo.id IN (SELECT max(x) FROM baz)"),
            "foo.id IN (SELECT max(x) FROM baz)"
        );
    }

    #[test]
    fn lowering_is_idempotent() {
        let once = lower("count_if(foo.id > 2) > 0 AND max(foo.id) < 9");
        let twice = to_sql(
            &lower_aggregates(&parse_expr(&once).unwrap()).unwrap(),
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn scalar_expressions_pass_through() {
        assert_eq!(lower("foo.id > 1 AND foo.name = 'x'"), "foo.id > 1 AND foo.name = 'x'");
    }

    #[test]
    fn windowed_calls_are_left_alone() {
        assert_eq!(
            lower("sum(foo.id) OVER () > 1"),
            "sum(foo.id) OVER () > 1"
        );
    }
}
