//! Column propagation through subqueries and CTEs
//!
//! A policy constraint evaluated in the outer query can only see columns a
//! derived table chooses to project. For every FROM-subquery or CTE that
//! reads a policy source, the columns the constraint needs are appended to
//! the inner projection (unless the inner query selects `*`, which already
//! exposes everything it can). The companion alias map lets the constraint
//! reference `alias.col` where `source.col` would not resolve.

use crate::ast::{self, TableRef};
use crate::policy::Policy;
use sqlparser::ast::{Expr, Ident, Query, Select};
use std::collections::{BTreeMap, BTreeSet};

/// Ensure every FROM-subquery and CTE projecting from a policy source also
/// projects the columns those policies need.
pub fn propagate_columns(query: &mut Query, policies: &[&Policy]) {
    let cte_count = query.with.as_ref().map(|w| w.cte_tables.len()).unwrap_or(0);
    for idx in 0..cte_count {
        let cte_query = query.with.as_mut().expect("counted above").cte_tables[idx]
            .query
            .as_mut();
        if let Some(select) = ast::query_select_mut(cte_query) {
            add_needed_columns(select, policies);
        }
    }

    if let Some(select) = ast::query_select_mut(query) {
        for (derived, _alias) in ast::derived_tables_in_from_mut(select) {
            if let Some(inner) = ast::query_select_mut(derived) {
                add_needed_columns(inner, policies);
            }
        }
    }
}

fn add_needed_columns(inner: &mut Select, policies: &[&Policy]) {
    if ast::has_wildcard_projection(inner) {
        return;
    }
    let inner_tables = ast::tables_in_from(inner);
    let mut selected = selected_names(inner);

    for policy in policies {
        for source in policy.source_names() {
            let Some(table_ref) = inner_tables.iter().find(|t| t.name == source) else {
                continue;
            };
            let qualifier = table_ref.alias.clone().unwrap_or_else(|| source.clone());
            for column in policy.source_columns_needed(&source) {
                if selected.contains(column) {
                    continue;
                }
                let expr = Expr::CompoundIdentifier(vec![
                    Ident::new(qualifier.clone()),
                    Ident::new(column.clone()),
                ]);
                ast::push_projection(inner, expr);
                selected.insert(column.clone());
            }
        }
    }
}

/// Names (lowercased) already visible in the projection: output names plus
/// the underlying column name of aliased column references.
fn selected_names(select: &Select) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for item in &select.projection {
        if let Some(name) = ast::projection_name(item) {
            names.insert(name);
        }
        if let sqlparser::ast::SelectItem::ExprWithAlias {
            expr: Expr::CompoundIdentifier(parts),
            ..
        } = item
            && let Some(last) = parts.last()
        {
            names.insert(last.value.to_lowercase());
        }
        if let sqlparser::ast::SelectItem::ExprWithAlias {
            expr: Expr::Identifier(ident),
            ..
        } = item
        {
            names.insert(ident.value.to_lowercase());
        }
    }
    names
}

/// Where each source hides: maps a source table to the FROM-subquery or CTE
/// alias that exposes it, for sources not named directly in the main FROM.
pub fn source_alias_mapping(query: &Query, sources: &BTreeSet<String>) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    let Some(select) = ast::query_select(query) else {
        return mapping;
    };

    let main_tables: BTreeSet<String> =
        ast::tables_in_from(select).into_iter().map(|t| t.name).collect();

    // FROM-subqueries in the main select.
    for twj in &select.from {
        collect_derived_mapping(&twj.relation, sources, &main_tables, &mut mapping);
        for join in &twj.joins {
            collect_derived_mapping(&join.relation, sources, &main_tables, &mut mapping);
        }
    }

    // CTE bodies.
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let alias = cte.alias.name.value.to_lowercase();
            if let Some(inner) = ast::query_select(&cte.query) {
                let inner_tables: BTreeSet<String> =
                    ast::tables_in_from(inner).into_iter().map(|t| t.name).collect();
                for source in sources {
                    if inner_tables.contains(source) && !main_tables.contains(source) {
                        mapping.entry(source.clone()).or_insert_with(|| alias.clone());
                    }
                }
            }
        }
    }

    mapping
}

fn collect_derived_mapping(
    factor: &sqlparser::ast::TableFactor,
    sources: &BTreeSet<String>,
    main_tables: &BTreeSet<String>,
    mapping: &mut BTreeMap<String, String>,
) {
    let sqlparser::ast::TableFactor::Derived {
        subquery,
        alias: Some(alias),
        ..
    } = factor
    else {
        return;
    };
    let alias = alias.name.value.to_lowercase();
    let Some(inner) = ast::query_select(subquery) else {
        return;
    };
    let inner_tables: Vec<TableRef> = ast::tables_in_from(inner);
    for source in sources {
        if inner_tables.iter().any(|t| &t.name == source) && !main_tables.contains(source) {
            mapping.entry(source.clone()).or_insert_with(|| alias.clone());
        }
    }
}

/// Sources that are matched by the statement but reachable neither in the
/// main FROM nor through a FROM-subquery or CTE: in practice, sources that
/// only appear inside WHERE-level subqueries such as EXISTS.
pub fn unreachable_sources(
    query: &Query,
    sources: &BTreeSet<String>,
    mapping: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    let mut unreachable = BTreeSet::new();
    let Some(select) = ast::query_select(query) else {
        return unreachable;
    };
    let main_tables: BTreeSet<String> =
        ast::tables_in_from(select).into_iter().map(|t| t.name).collect();
    for source in sources {
        if !main_tables.contains(source) && !mapping.contains_key(source) {
            unreachable.insert(source.clone());
        }
    }
    unreachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{parse_statement, statement_query, statement_query_mut, to_sql};
    use crate::policy::{Action, Policy};

    fn policy(sources: &[&str], constraint: &str) -> Policy {
        Policy::new(
            sources.iter().map(|s| s.to_string()).collect(),
            None,
            constraint,
            Action::Remove,
            None,
        )
        .unwrap()
    }

    fn transform_with(sql: &str, policies: &[&Policy]) -> String {
        let mut stmt = parse_statement(sql).unwrap();
        propagate_columns(statement_query_mut(&mut stmt).unwrap(), policies);
        to_sql(&stmt)
    }

    #[test]
    fn adds_missing_columns_to_subquery() {
        let p = policy(&["foo"], "max(foo.id) > 1");
        let rewritten = transform_with("SELECT name FROM (SELECT name FROM foo) AS sub", &[&p]);
        assert_eq!(
            rewritten,
            "SELECT name FROM (SELECT name, foo.id FROM foo) AS sub"
        );
    }

    #[test]
    fn respects_inner_table_alias() {
        let p = policy(&["foo"], "max(foo.id) > 1");
        let rewritten = transform_with("SELECT name FROM (SELECT f.name FROM foo f) AS sub", &[&p]);
        assert_eq!(
            rewritten,
            "SELECT name FROM (SELECT f.name, f.id FROM foo AS f) AS sub"
        );
    }

    #[test]
    fn leaves_star_projections_alone() {
        let p = policy(&["foo"], "max(foo.id) > 1");
        let rewritten = transform_with("SELECT * FROM (SELECT * FROM foo) AS sub", &[&p]);
        assert_eq!(rewritten, "SELECT * FROM (SELECT * FROM foo) AS sub");
    }

    #[test]
    fn already_projected_columns_are_not_duplicated() {
        let p = policy(&["foo"], "max(foo.id) > 1");
        let rewritten = transform_with("SELECT id FROM (SELECT id FROM foo) AS sub", &[&p]);
        assert_eq!(rewritten, "SELECT id FROM (SELECT id FROM foo) AS sub");
    }

    #[test]
    fn adds_columns_to_ctes() {
        let p = policy(&["foo"], "max(foo.id) > 1");
        let rewritten = transform_with(
            "WITH f AS (SELECT name FROM foo) SELECT name FROM f",
            &[&p],
        );
        assert_eq!(
            rewritten,
            "WITH f AS (SELECT name, foo.id FROM foo) SELECT name FROM f"
        );
    }

    #[test]
    fn mapping_points_sources_at_their_aliases() {
        let stmt =
            parse_statement("SELECT sub.name FROM (SELECT foo.name FROM foo JOIN baz ON TRUE) AS sub")
                .unwrap();
        let query = statement_query(&stmt).unwrap();
        let sources = BTreeSet::from(["foo".to_string(), "baz".to_string()]);
        let mapping = source_alias_mapping(query, &sources);
        assert_eq!(mapping.get("foo").map(String::as_str), Some("sub"));
        assert_eq!(mapping.get("baz").map(String::as_str), Some("sub"));
    }

    #[test]
    fn mapping_skips_sources_in_main_from() {
        let stmt = parse_statement("SELECT id FROM foo").unwrap();
        let query = statement_query(&stmt).unwrap();
        let sources = BTreeSet::from(["foo".to_string()]);
        assert!(source_alias_mapping(query, &sources).is_empty());
    }

    #[test]
    fn exists_only_source_is_unreachable() {
        let stmt = parse_statement(
            "SELECT o_orderkey FROM orders WHERE EXISTS (SELECT * FROM lineitem WHERE l_orderkey = o_orderkey)",
        )
        .unwrap();
        let query = statement_query(&stmt).unwrap();
        let sources = BTreeSet::from(["lineitem".to_string()]);
        let mapping = source_alias_mapping(query, &sources);
        let unreachable = unreachable_sources(query, &sources, &mapping);
        assert!(unreachable.contains("lineitem"));
    }
}
