//! Output rendering for the CLI
//!
//! Result rows render as TSV (matching the stream-file conventions: NULL
//! spelled out, booleans lowercase); policy listings render as JSON.

use crate::policy::{AggregatePolicy, Policy};
use duckdb::types::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One engine value as TSV field text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::UTinyInt(v) => v.to_string(),
        Value::USmallInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

/// Result rows as TSV lines.
pub fn render_rows(rows: &[Vec<Value>]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(render_value)
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Registered policies as a pretty-printed JSON document.
pub fn render_policies(
    policies: &[Policy],
    aggregate_policies: &[AggregatePolicy],
) -> Result<String, ReportError> {
    let listing = serde_json::json!({
        "policies": policies,
        "aggregate_policies": aggregate_policies,
    });
    Ok(serde_json::to_string_pretty(&listing)?)
}

/// Finalize verdicts, one line per policy.
pub fn render_violations(
    violations: &std::collections::BTreeMap<String, Option<String>>,
) -> String {
    violations
        .iter()
        .map(|(policy_id, verdict)| match verdict {
            None => format!("{policy_id}\tok"),
            Some(message) => format!("{policy_id}\tviolated\t{message}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
