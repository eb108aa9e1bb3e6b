//! Policy registry
//!
//! Registration is the binding step: a policy that passed construction can
//! still be rejected here when its tables or columns do not exist in the
//! engine catalog, or when an INVALIDATE-family sink is missing the columns
//! the rewrite will write to.

use crate::ast::expr;
use crate::catalog::Catalog;
use crate::policy::{Action, AggregatePolicy, Policy, PolicyError};
use duckdb::Connection;

#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: Vec<Policy>,
    aggregate_policies: Vec<AggregatePolicy>,
}

/// Wildcard match spec for [`PolicyRegistry::delete`]. `None` (or an empty
/// constraint) matches any value of that field.
#[derive(Debug, Default, Clone)]
pub struct DeleteFilter<'a> {
    pub source: Option<&'a str>,
    pub sink: Option<&'a str>,
    pub constraint: &'a str,
    pub action: Option<Action>,
    pub description: Option<&'a str>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn aggregate_policies(&self) -> &[AggregatePolicy] {
        &self.aggregate_policies
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.aggregate_policies.is_empty()
    }

    pub fn register(
        &mut self,
        policy: Policy,
        catalog: &mut Catalog,
        conn: &Connection,
    ) -> Result<(), PolicyError> {
        for source in policy.sources() {
            require_table(catalog, conn, source, "source")?;
        }
        if let Some(sink) = policy.sink() {
            require_table(catalog, conn, sink, "sink")?;
        }

        let source_names = policy.source_names();
        let sink_lower = policy.sink_lower();
        for occ in expr::collect_columns(policy.constraint_expr()) {
            let Some(table) = occ.table else {
                // Qualification is enforced at construction; a bare column
                // here means the policy bypassed `Policy::new`.
                return Err(PolicyError::UnqualifiedColumn {
                    columns: occ.column,
                });
            };
            let column = occ.column.to_lowercase();
            if source_names.contains(&table) {
                require_column(catalog, &table, &column, "source")?;
            } else if sink_lower.as_deref() == Some(table.as_str()) {
                require_column(catalog, &table, &column, "sink")?;
            } else {
                return Err(PolicyError::UnknownTable {
                    kind: "referenced",
                    name: table,
                });
            }
        }

        if policy.action().is_invalidate()
            && let Some(sink) = policy.sink()
        {
            require_typed_column(catalog, sink, "valid", "BOOLEAN", policy.action())?;
            if policy.action() == Action::InvalidateMessage {
                require_typed_column(catalog, sink, "message", "VARCHAR", policy.action())?;
            }
        }

        self.policies.push(policy);
        Ok(())
    }

    pub fn register_aggregate(
        &mut self,
        policy: AggregatePolicy,
        catalog: &mut Catalog,
        conn: &Connection,
    ) -> Result<(), PolicyError> {
        if let Some(source) = policy.source() {
            require_table(catalog, conn, source, "source")?;
        }
        if let Some(sink) = policy.sink() {
            require_table(catalog, conn, sink, "sink")?;
        }

        let source_lower = policy.source_lower();
        let sink_lower = policy.sink_lower();
        for occ in expr::collect_columns(policy.constraint_expr()) {
            let Some(table) = occ.table else {
                // Bare table names standing for whole rows were accepted at
                // construction; nothing to bind for them.
                continue;
            };
            let column = occ.column.to_lowercase();
            if source_lower.as_deref() == Some(table.as_str()) {
                require_column(catalog, &table, &column, "source")?;
            } else if sink_lower.as_deref() == Some(table.as_str()) {
                require_column(catalog, &table, &column, "sink")?;
            } else {
                return Err(PolicyError::UnknownTable {
                    kind: "referenced",
                    name: table,
                });
            }
        }

        self.aggregate_policies.push(policy);
        Ok(())
    }

    /// Remove the first policy matching the filter. At least one of source,
    /// sink, or constraint must be given. Returns whether one was removed.
    pub fn delete(&mut self, filter: &DeleteFilter<'_>) -> Result<bool, PolicyError> {
        if filter.source.is_none() && filter.sink.is_none() && filter.constraint.is_empty() {
            return Err(PolicyError::ParseError(
                "at least one of source, sink, or constraint must be provided".to_string(),
            ));
        }
        let position = self.policies.iter().position(|p| {
            let source_match = filter
                .source
                .is_none_or(|s| p.source_names().contains(&s.to_lowercase()));
            let sink_match = filter
                .sink
                .is_none_or(|s| p.sink_lower().as_deref() == Some(s.to_lowercase().as_str()));
            let constraint_match = filter.constraint.is_empty() || p.constraint() == filter.constraint;
            let action_match = filter.action.is_none_or(|a| p.action() == a);
            let description_match = filter.description.is_none_or(|d| p.description() == Some(d));
            source_match && sink_match && constraint_match && action_match && description_match
        });
        match position {
            Some(idx) => {
                self.policies.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn require_table(
    catalog: &mut Catalog,
    conn: &Connection,
    name: &str,
    kind: &'static str,
) -> Result<(), PolicyError> {
    catalog
        .table(conn, name)
        .map(|_| ())
        .ok_or_else(|| PolicyError::UnknownTable {
            kind,
            name: name.to_string(),
        })
}

fn require_column(
    catalog: &Catalog,
    table: &str,
    column: &str,
    kind: &'static str,
) -> Result<(), PolicyError> {
    let schema = catalog.cached(table).ok_or_else(|| PolicyError::UnknownTable {
        kind,
        name: table.to_string(),
    })?;
    if schema.has_column(column) {
        Ok(())
    } else {
        Err(PolicyError::UnknownColumn {
            kind,
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

fn require_typed_column(
    catalog: &Catalog,
    sink: &str,
    column: &'static str,
    expected: &'static str,
    action: Action,
) -> Result<(), PolicyError> {
    let missing = || PolicyError::MissingValidColumn {
        sink: sink.to_string(),
        column,
        expected,
        action,
    };
    let schema = catalog.cached(sink).ok_or_else(missing)?;
    match schema.column_type(column) {
        Some(ty) if ty.eq_ignore_ascii_case(expected) => Ok(()),
        _ => Err(missing()),
    }
}
