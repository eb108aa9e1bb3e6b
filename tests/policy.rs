//! Policy construction and validation matrix.

use dfc_rewriter::policy::dsl;
use dfc_rewriter::{Action, AggregatePolicy, Policy, PolicyError};
use proptest::prelude::*;

fn policy(sources: &[&str], sink: Option<&str>, constraint: &str, action: Action) -> Result<Policy, PolicyError> {
    Policy::new(
        sources.iter().map(|s| s.to_string()).collect(),
        sink.map(str::to_string),
        constraint,
        action,
        None,
    )
}

#[test]
fn source_only_rejects_unaggregated_source_columns() {
    let err = policy(&["users"], None, "users.age >= 18", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::SourceNotAggregated { .. }));
    assert!(err.to_string().contains("must be aggregated"));
}

#[test]
fn source_only_accepts_aggregated_columns() {
    let p = policy(&["users"], None, "max(users.age) >= 18", Action::Remove).unwrap();
    assert_eq!(p.sources(), ["users"]);
    assert_eq!(p.sink(), None);
    assert_eq!(p.constraint(), "max(users.age) >= 18");
    assert_eq!(p.action(), Action::Remove);
}

#[test]
fn sink_only_columns_need_no_aggregation() {
    let p = policy(&[], Some("reports"), "reports.status = 'approved'", Action::Kill).unwrap();
    assert!(p.sources().is_empty());
    assert_eq!(p.sink(), Some("reports"));
}

#[test]
fn both_source_and_sink() {
    let p = policy(
        &["users"],
        Some("analytics"),
        "max(users.id) = analytics.user_id",
        Action::Remove,
    )
    .unwrap();
    assert_eq!(p.sources(), ["users"]);
    assert_eq!(p.sink(), Some("analytics"));
}

#[test]
fn requires_source_or_sink() {
    let err = policy(&[], None, "1 = 1", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::MissingSourceOrSink));
}

#[test]
fn rejects_invalid_table_identifiers() {
    let err = policy(&["not a table"], None, "max(users.age) > 1", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::InvalidIdentifier { .. }));

    let err = policy(&[], Some("123bad"), "x.y = 1", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::InvalidIdentifier { .. }));
}

#[test]
fn rejects_malformed_constraints() {
    let err = policy(&["users"], None, "max(users.age >", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::ParseError(_)));
}

#[test]
fn rejects_select_statements_as_constraints() {
    let err = policy(&["users"], None, "SELECT * FROM users", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::ParseError(_)));
    assert!(err.to_string().contains("not a SELECT"));

    let err = policy(&["users"], None, "(SELECT max(age) FROM users)", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::ParseError(_)));
}

#[test]
fn rejects_unqualified_columns() {
    let err = policy(&["users"], None, "max(age) >= 18", Action::Remove).unwrap_err();
    let PolicyError::UnqualifiedColumn { columns } = &err else {
        panic!("expected UnqualifiedColumn, got {err:?}");
    };
    assert!(columns.contains("age"));
}

#[test]
fn rejects_aggregation_over_sink() {
    let err = policy(
        &["users"],
        Some("reports"),
        "max(reports.total) > 10",
        Action::Remove,
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::IllegalAggregationTarget { .. }));
}

#[test]
fn rejects_aggregation_over_foreign_table() {
    let err = policy(&["users"], None, "max(other.age) > 10", Action::Remove).unwrap_err();
    let PolicyError::IllegalAggregationTarget { table, .. } = &err else {
        panic!("expected IllegalAggregationTarget, got {err:?}");
    };
    assert_eq!(table, "other");
}

#[test]
fn rejects_aggregation_without_source() {
    let err = policy(&[], Some("reports"), "max(reports.x) > 1", Action::Remove).unwrap_err();
    assert!(matches!(err, PolicyError::IllegalAggregationTarget { .. }));
}

#[test]
fn mixed_constraint_with_aggregated_source_and_bare_sink() {
    let p = policy(
        &["users"],
        Some("reports"),
        "max(users.id) > reports.threshold",
        Action::Remove,
    )
    .unwrap();
    assert_eq!(p.source_columns_needed("users"), ["id"]);
}

#[test]
fn multi_source_requires_each_source_aggregated() {
    let p = policy(
        &["foo", "baz"],
        None,
        "max(foo.id) >= 2 AND max(baz.x) <= 20",
        Action::Remove,
    )
    .unwrap();
    assert_eq!(p.source_columns_needed("foo"), ["id"]);
    assert_eq!(p.source_columns_needed("baz"), ["x"]);

    let err = policy(&["foo", "baz"], None, "max(foo.id) >= 2 AND baz.x <= 20", Action::Remove)
        .unwrap_err();
    assert!(matches!(err, PolicyError::SourceNotAggregated { .. }));
}

#[test]
fn count_star_constraint_is_accepted() {
    let p = policy(&["users"], None, "count(*) > 5", Action::Remove).unwrap();
    assert_eq!(p.source_columns_needed("users"), [] as [&str; 0]);
}

#[test]
fn equality_ignores_description_only_when_equal() {
    let a = policy(&["foo"], None, "max(foo.id) > 1", Action::Remove).unwrap();
    let b = policy(&["foo"], None, "max(foo.id) > 1", Action::Remove).unwrap();
    let c = policy(&["foo"], None, "max(foo.id) > 1", Action::Kill).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

// ---- DSL text form ---------------------------------------------------------

#[test]
fn from_text_builds_a_policy() {
    let p = Policy::from_text(
        "SOURCE users CONSTRAINT max(users.age) >= 18 ON FAIL REMOVE DESCRIPTION adults only",
    )
    .unwrap();
    assert_eq!(p.sources(), ["users"]);
    assert_eq!(p.action(), Action::Remove);
    assert_eq!(p.description(), Some("adults only"));
}

#[test]
fn from_text_rejects_aggregate_prefix() {
    let err = Policy::from_text(
        "AGGREGATE SOURCE users CONSTRAINT sum(users.x) > 1 ON FAIL INVALIDATE",
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::ParseError(_)));
}

#[test]
fn from_text_requires_source_or_sink() {
    let err = Policy::from_text("CONSTRAINT 1 = 1 ON FAIL REMOVE").unwrap_err();
    assert!(matches!(err, PolicyError::MissingSourceOrSink));
}

// ---- aggregate policies ----------------------------------------------------

#[test]
fn aggregate_policy_requires_source_or_sink() {
    let err = AggregatePolicy::new(None, None, "max(users.age) >= 18", Action::Invalidate, None)
        .unwrap_err();
    assert!(matches!(err, PolicyError::MissingSourceOrSink));
}

#[test]
fn aggregate_policy_only_supports_invalidate() {
    let err = AggregatePolicy::new(
        Some("users".into()),
        None,
        "sum(users.amount) > 100",
        Action::Remove,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::UnsupportedAction));
}

#[test]
fn aggregate_policy_allows_sink_aggregation_and_bare_sink_columns() {
    let p = AggregatePolicy::new(
        Some("users".into()),
        Some("reports".into()),
        "sum(users.amount) > sum(reports.total)",
        Action::Invalidate,
        None,
    )
    .unwrap();
    assert_eq!(p.constraint(), "sum(users.amount) > sum(reports.total)");

    AggregatePolicy::new(
        Some("users".into()),
        Some("reports".into()),
        "sum(users.amount) > reports.threshold",
        Action::Invalidate,
        None,
    )
    .unwrap();
}

#[test]
fn aggregate_policy_allows_nested_aggregates() {
    AggregatePolicy::new(
        Some("users".into()),
        Some("reports".into()),
        "max(sum(users.amount)) > 500",
        Action::Invalidate,
        None,
    )
    .unwrap();
}

#[test]
fn aggregate_policy_accepts_bare_table_name_in_aggregate() {
    let p = AggregatePolicy::new(
        Some("bank_txn".into()),
        Some("irs_form".into()),
        "sum(irs_form) FILTER (WHERE irs_form.kind = 'Income') > 4000",
        Action::Invalidate,
        None,
    )
    .unwrap();
    assert!(p.constraint().to_lowercase().contains("filter"));
}

#[test]
fn aggregate_policy_still_requires_source_aggregation_and_qualification() {
    let err = AggregatePolicy::new(
        Some("users".into()),
        None,
        "users.amount > 100",
        Action::Invalidate,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::SourceNotAggregated { .. }));

    let err = AggregatePolicy::new(
        Some("users".into()),
        None,
        "sum(amount) > 100",
        Action::Invalidate,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::UnqualifiedColumn { .. }));
}

#[test]
fn aggregate_policy_ids_are_stable_and_distinct() {
    let make = |constraint: &str| {
        AggregatePolicy::new(
            Some("users".into()),
            Some("reports".into()),
            constraint,
            Action::Invalidate,
            None,
        )
        .unwrap()
    };
    let a = make("sum(users.amount) > 100");
    let b = make("sum(users.amount) > 100");
    let c = make("sum(users.amount) > 200");
    assert_eq!(a.id(), b.id());
    assert_ne!(a.id(), c.id());
    assert_eq!(a.temp_column(1), format!("_{}_tmp1", a.id()));
}

#[test]
fn aggregate_policy_from_text_requires_prefix_and_single_source() {
    let p = AggregatePolicy::from_text(
        "AGGREGATE SOURCE bank_txn SINK irs_form CONSTRAINT sum(irs_form.amount) > 4000 ON FAIL INVALIDATE",
    )
    .unwrap();
    assert_eq!(p.source(), Some("bank_txn"));
    assert_eq!(p.sink(), Some("irs_form"));

    let err = AggregatePolicy::from_text(
        "SOURCE bank_txn CONSTRAINT sum(bank_txn.amount) > 1 ON FAIL INVALIDATE",
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::ParseError(_)));
}

// ---- properties ------------------------------------------------------------

proptest! {
    #[test]
    fn dsl_roundtrips_generated_tables(suffix in "[a-z0-9_]{0,12}", action_idx in 0usize..6) {
        let table = format!("t_{suffix}");
        let actions = ["REMOVE", "KILL", "INVALIDATE", "INVALIDATE_MESSAGE", "HUMAN", "LLM"];
        let action = actions[action_idx];
        let text = format!("SOURCE {table} CONSTRAINT max({table}.id) > 1 ON FAIL {action}");
        let parsed = dsl::parse_policy_text(&text).unwrap();
        prop_assert_eq!(parsed.sources, vec![table.clone()]);
        prop_assert_eq!(parsed.action.to_string(), action);
        prop_assert_eq!(parsed.constraint, format!("max({table}.id) > 1"));
    }

    #[test]
    fn construction_never_panics_on_arbitrary_constraints(constraint in ".{0,40}") {
        // Errors are fine; panics are not.
        let _ = Policy::new(vec!["foo".to_string()], None, &constraint, Action::Remove, None);
    }
}
