//! Aggregate-policy INSERT rewriting and finalize evaluation.

use dfc_rewriter::{Action, AggregatePolicy, Rewriter};
use duckdb::types::Value;

fn fixture() -> Rewriter {
    let mut rewriter = Rewriter::new().unwrap();
    rewriter
        .execute("CREATE TABLE bank_txn (txn_id INTEGER, amount DOUBLE)")
        .unwrap();
    rewriter
        .execute("INSERT INTO bank_txn VALUES (1, 100.0), (2, 200.0), (3, 300.0)")
        .unwrap();
    rewriter
}

fn income_policy() -> AggregatePolicy {
    AggregatePolicy::new(
        Some("bank_txn".to_string()),
        Some("irs_form".to_string()),
        "sum(irs_form.amount) FILTER (WHERE irs_form.kind = 'Income') > 4000",
        Action::Invalidate,
        None,
    )
    .unwrap()
}

#[test]
fn insert_gains_temp_columns_in_list_and_projection() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE irs_form (txn_id INTEGER, amount DOUBLE, kind VARCHAR)")
        .unwrap();
    let policy = income_policy();
    let temp = policy.temp_column(1);
    rewriter.register_aggregate_policy(policy).unwrap();
    rewriter
        .execute(&format!("ALTER TABLE irs_form ADD COLUMN {temp} DOUBLE"))
        .unwrap();

    let transformed = rewriter
        .transform_query(
            "INSERT INTO irs_form (txn_id, amount, kind) SELECT txn_id, abs(amount), 'Expense' FROM bank_txn WHERE txn_id = 1",
        )
        .unwrap();

    // Temp column lands in the INSERT column list...
    let insert_part = transformed.split("SELECT").next().unwrap();
    assert!(insert_part.contains(&temp));
    // ...and its projection folds the FILTER into a CASE with the concrete
    // output value replacing the sink column reference.
    assert!(transformed.contains("CASE WHEN 'Expense' = 'Income' THEN abs(amount) ELSE 0 END"));
}

#[test]
fn temp_column_holds_zero_for_expense_and_amount_for_income() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE irs_form (txn_id INTEGER, amount DOUBLE, kind VARCHAR)")
        .unwrap();
    let policy = income_policy();
    let temp = policy.temp_column(1);
    rewriter.register_aggregate_policy(policy).unwrap();
    rewriter
        .execute(&format!("ALTER TABLE irs_form ADD COLUMN {temp} DOUBLE"))
        .unwrap();

    rewriter
        .execute("INSERT INTO irs_form (txn_id, amount, kind) SELECT txn_id, abs(amount), 'Expense' FROM bank_txn WHERE txn_id = 1")
        .unwrap();
    rewriter
        .execute("INSERT INTO irs_form (txn_id, amount, kind) SELECT txn_id, abs(amount), 'Income' FROM bank_txn WHERE txn_id = 2")
        .unwrap();

    let rows = rewriter
        .fetch_all(&format!("SELECT kind, {temp} FROM irs_form ORDER BY txn_id"))
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Text("Expense".into()), Value::Double(0.0)],
            vec![Value::Text("Income".into()), Value::Double(200.0)],
        ]
    );
}

#[test]
fn finalize_reports_nothing_for_unrelated_sink() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE irs_form (txn_id INTEGER, amount DOUBLE, kind VARCHAR)")
        .unwrap();
    rewriter.register_aggregate_policy(income_policy()).unwrap();
    let violations = rewriter.finalize_aggregate_policies("other_table").unwrap();
    assert!(violations.is_empty());
}

#[test]
fn finalize_passes_and_fails_on_filtered_sums() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE irs_form (txn_id INTEGER, amount DOUBLE, kind VARCHAR)")
        .unwrap();
    let policy = income_policy();
    let policy_id = policy.id().to_string();
    let temp = policy.temp_column(1);
    rewriter.register_aggregate_policy(policy).unwrap();
    rewriter
        .execute(&format!("ALTER TABLE irs_form ADD COLUMN {temp} DOUBLE"))
        .unwrap();

    // Income totals 3500 < 4000: violation, message carries the constraint.
    rewriter
        .execute(&format!(
            "INSERT INTO irs_form (txn_id, amount, kind, {temp}) VALUES \
             (1, 1500.0, 'Income', 1500.0), \
             (2, 250.0, 'Expense', 250.0), \
             (3, 2000.0, 'Income', 2000.0), \
             (4, 500.0, 'Expense', 500.0)"
        ))
        .unwrap();
    let violations = rewriter.finalize_aggregate_policies("irs_form").unwrap();
    let message = violations.get(&policy_id).unwrap().as_ref().unwrap();
    assert!(message.contains("Aggregate policy constraint violated"));
    assert!(message.to_lowercase().contains("filter"));
    assert!(message.contains("irs_form.kind = 'Income'"));

    // Top up Income beyond the threshold: passes.
    rewriter
        .execute(&format!(
            "INSERT INTO irs_form (txn_id, amount, kind, {temp}) VALUES (5, 1000.0, 'Income', 1000.0)"
        ))
        .unwrap();
    let violations = rewriter.finalize_aggregate_policies("irs_form").unwrap();
    assert!(violations.get(&policy_id).unwrap().is_none());
}

#[test]
fn finalize_applies_outer_aggregate_for_nested_constraints() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE reports (id INTEGER, value DOUBLE)")
        .unwrap();
    let policy = AggregatePolicy::new(
        Some("bank_txn".to_string()),
        Some("reports".to_string()),
        "max(sum(bank_txn.amount)) > 500",
        Action::Invalidate,
        None,
    )
    .unwrap();
    let policy_id = policy.id().to_string();
    let temp = policy.temp_column(1);
    rewriter.register_aggregate_policy(policy).unwrap();
    rewriter
        .execute(&format!("ALTER TABLE reports ADD COLUMN {temp} DOUBLE"))
        .unwrap();

    // Inner sums per group: 150, 250, 350 -> max 350, not > 500: violation.
    rewriter
        .execute(&format!(
            "INSERT INTO reports (id, value, {temp}) VALUES \
             (1, 100.0, 150.0), (2, 200.0, 250.0), (3, 300.0, 350.0)"
        ))
        .unwrap();
    let violations = rewriter.finalize_aggregate_policies("reports").unwrap();
    let message = violations.get(&policy_id).unwrap().as_ref().unwrap();
    assert!(message.contains("max(sum(bank_txn.amount)) > 500"));

    // A 600 partial sum pushes the max over the threshold.
    rewriter
        .execute(&format!(
            "INSERT INTO reports (id, value, {temp}) VALUES (4, 400.0, 600.0)"
        ))
        .unwrap();
    let violations = rewriter.finalize_aggregate_policies("reports").unwrap();
    assert!(violations.get(&policy_id).unwrap().is_none());
}

#[test]
fn finalize_with_description_prefixes_the_message() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE reports (id INTEGER, value DOUBLE)")
        .unwrap();
    let policy = AggregatePolicy::new(
        Some("bank_txn".to_string()),
        Some("reports".to_string()),
        "sum(bank_txn.amount) > 1000",
        Action::Invalidate,
        Some("Test policy description".to_string()),
    )
    .unwrap();
    let policy_id = policy.id().to_string();
    let temp = policy.temp_column(1);
    rewriter.register_aggregate_policy(policy).unwrap();
    rewriter
        .execute(&format!("ALTER TABLE reports ADD COLUMN {temp} DOUBLE"))
        .unwrap();
    rewriter
        .execute(&format!(
            "INSERT INTO reports (id, value, {temp}) VALUES \
             (1, 100.0, 100.0), (2, 200.0, 200.0), (3, 300.0, 300.0)"
        ))
        .unwrap();

    let violations = rewriter.finalize_aggregate_policies("reports").unwrap();
    let message = violations.get(&policy_id).unwrap().as_ref().unwrap();
    assert_eq!(
        message,
        "Test policy description: Aggregate policy constraint violated: sum(bank_txn.amount) > 1000"
    );
}

#[test]
fn finalize_of_empty_or_dropped_sink_reports_none() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE reports (id INTEGER, value DOUBLE)")
        .unwrap();
    let policy = AggregatePolicy::new(
        Some("bank_txn".to_string()),
        Some("reports".to_string()),
        "sum(bank_txn.amount) > 100",
        Action::Invalidate,
        None,
    )
    .unwrap();
    let policy_id = policy.id().to_string();
    rewriter.register_aggregate_policy(policy).unwrap();

    // No rows yet: nothing to check.
    let violations = rewriter.finalize_aggregate_policies("reports").unwrap();
    assert!(violations.get(&policy_id).unwrap().is_none());

    // Dropped table: still no violation, not an error.
    rewriter.execute("DROP TABLE reports").unwrap();
    let violations = rewriter.finalize_aggregate_policies("reports").unwrap();
    assert!(violations.get(&policy_id).unwrap().is_none());
}

#[test]
fn aggregate_policies_are_tracked_separately_from_regular_ones() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE irs_form (txn_id INTEGER, amount DOUBLE, kind VARCHAR)")
        .unwrap();
    rewriter.register_aggregate_policy(income_policy()).unwrap();
    assert_eq!(rewriter.aggregate_policies().len(), 1);
    assert!(rewriter.policies().is_empty());
}

#[test]
fn aggregate_policy_registers_from_dsl_text() {
    let mut rewriter = fixture();
    rewriter
        .execute("CREATE TABLE irs_form (txn_id INTEGER, amount DOUBLE, kind VARCHAR)")
        .unwrap();
    rewriter
        .register_policy_text(
            "AGGREGATE SOURCE bank_txn SINK irs_form \
             CONSTRAINT sum(irs_form.amount) > 4000 ON FAIL INVALIDATE",
        )
        .unwrap();
    assert_eq!(rewriter.aggregate_policies().len(), 1);
}
