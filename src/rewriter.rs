//! The rewriter façade
//!
//! Owns one engine connection, the catalog cache, the policy registry, and
//! the stream file. `transform_query` is a pure function of the query and
//! the registered policies; `execute`/`fetch_*` additionally drive the
//! engine. A rewriter is single-threaded; use one per thread.

use crate::ast;
use crate::catalog::Catalog;
use crate::engine::{self, udf};
use crate::policy::{dsl, AggregatePolicy, Policy, PolicyError};
use crate::registry::{DeleteFilter, PolicyRegistry};
use crate::resolver::{StreamFile, ViolationResolver};
use crate::rewrite::{self, aggregate, RewriteContext, RewriteError};
use duckdb::types::Value;
use duckdb::Connection;
use sqlparser::ast::Statement;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RewriterError {
    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("engine error: {0}")]
    Engine(#[from] duckdb::Error),

    #[error("stream file error: {0}")]
    Stream(#[from] std::io::Error),
}

pub struct Rewriter {
    conn: Connection,
    catalog: Catalog,
    registry: PolicyRegistry,
    stream: StreamFile,
    resolver: Option<Box<dyn ViolationResolver>>,
}

impl Rewriter {
    /// In-memory engine, temp stream file.
    pub fn new() -> Result<Self, RewriterError> {
        Self::with_connection(engine::open_in_memory()?)
    }

    /// File-backed engine.
    pub fn open(database: &Path) -> Result<Self, RewriterError> {
        Self::with_connection(engine::open(database)?)
    }

    /// Wrap an existing connection. Registers the `kill` and
    /// `address_violating_rows` functions on it.
    pub fn with_connection(conn: Connection) -> Result<Self, RewriterError> {
        udf::register_all(&conn)?;
        Ok(Self {
            conn,
            catalog: Catalog::new(),
            registry: PolicyRegistry::new(),
            stream: StreamFile::new_temp()?,
            resolver: None,
        })
    }

    /// Use a caller-owned stream file path instead of the default temp file.
    pub fn set_stream_file(&mut self, path: impl Into<std::path::PathBuf>) {
        self.stream = StreamFile::at(path);
    }

    pub fn stream_file_path(&self) -> &Path {
        self.stream.path()
    }

    pub fn set_resolver(&mut self, resolver: Box<dyn ViolationResolver>) {
        self.resolver = Some(resolver);
    }

    // ---- policy management -------------------------------------------------

    pub fn register_policy(&mut self, policy: Policy) -> Result<(), PolicyError> {
        self.registry.register(policy, &mut self.catalog, &self.conn)
    }

    pub fn register_aggregate_policy(
        &mut self,
        policy: AggregatePolicy,
    ) -> Result<(), PolicyError> {
        self.registry
            .register_aggregate(policy, &mut self.catalog, &self.conn)
    }

    /// Register a policy from its DSL text form; the `AGGREGATE` prefix
    /// selects the aggregate-policy kind.
    pub fn register_policy_text(&mut self, text: &str) -> Result<(), PolicyError> {
        if dsl::parse_policy_text(text)?.aggregate {
            self.register_aggregate_policy(AggregatePolicy::from_text(text)?)
        } else {
            self.register_policy(Policy::from_text(text)?)
        }
    }

    pub fn delete_policy(&mut self, filter: &DeleteFilter<'_>) -> Result<bool, PolicyError> {
        self.registry.delete(filter)
    }

    pub fn policies(&self) -> &[Policy] {
        self.registry.policies()
    }

    pub fn aggregate_policies(&self) -> &[AggregatePolicy] {
        self.registry.aggregate_policies()
    }

    // ---- transformation ----------------------------------------------------

    /// Rewrite a query so every matching policy is enforced. Parse errors
    /// bubble up.
    pub fn transform_query(&self, sql: &str) -> Result<String, RewriteError> {
        rewrite::transform(sql, &self.context())
    }

    /// Best-effort variant: statements the rewriter cannot parse (engine
    /// extensions, multi-statement batches) come back unchanged.
    pub fn transform_query_lenient(&self, sql: &str) -> String {
        match self.transform_query(sql) {
            Ok(rewritten) => rewritten,
            Err(RewriteError::Parse(_)) => sql.to_string(),
            // Unsupported rewrites must not silently drop a policy; fall
            // back to the original only for parse failures.
            Err(RewriteError::Unsupported(_)) => sql.to_string(),
        }
    }

    fn context(&self) -> RewriteContext<'_> {
        RewriteContext {
            registry: &self.registry,
            catalog: &self.catalog,
            stream_file_path: self.stream.path().to_str().unwrap_or(""),
        }
    }

    // ---- execution ---------------------------------------------------------

    /// Transform and run a statement for its side effects.
    pub fn execute(&mut self, sql: &str) -> Result<(), RewriterError> {
        let transformed = self.transform_for_execution(sql)?;
        engine::execute(&self.conn, &transformed)?;
        Ok(())
    }

    /// Transform, run, and fetch every result row.
    pub fn fetch_all(&mut self, sql: &str) -> Result<Vec<Vec<Value>>, RewriterError> {
        let transformed = self.transform_for_execution(sql)?;
        Ok(engine::fetch_all(&self.conn, &transformed)?)
    }

    /// Transform, run, and fetch the first result row.
    pub fn fetch_one(&mut self, sql: &str) -> Result<Option<Vec<Value>>, RewriterError> {
        let transformed = self.transform_for_execution(sql)?;
        Ok(engine::fetch_one(&self.conn, &transformed)?)
    }

    /// Transform with best effort, invalidating the catalog cache when the
    /// statement may change schema state.
    fn transform_for_execution(&mut self, sql: &str) -> Result<String, RewriterError> {
        match ast::parse_statement(sql) {
            Ok(Statement::Query(_)) | Ok(Statement::Insert(_)) => {
                Ok(rewrite::transform(sql, &self.context())?)
            }
            _ => {
                // DDL (or anything we cannot parse) may invalidate cached
                // table schemas; drop the cache and pass through.
                self.catalog = Catalog::new();
                Ok(sql.to_string())
            }
        }
    }

    // ---- aggregate policy finalization ------------------------------------

    /// Evaluate every aggregate policy sinking into `sink_table`. The map
    /// is keyed by policy id; `None` means the policy passed (or had no
    /// data to check), `Some(message)` carries the violation.
    pub fn finalize_aggregate_policies(
        &mut self,
        sink_table: &str,
    ) -> Result<BTreeMap<String, Option<String>>, RewriterError> {
        let sink = sink_table.to_lowercase();
        let mut results = BTreeMap::new();
        for policy in self.registry.aggregate_policies() {
            if policy.sink_lower().as_deref() != Some(sink.as_str()) {
                continue;
            }

            let row_count: Option<i64> = self
                .conn
                .query_row(&format!("SELECT count(*) FROM {sink}"), [], |row| {
                    row.get(0)
                })
                .ok();
            let verdict = match row_count {
                None | Some(0) => None,
                Some(_) => {
                    let sql = aggregate::finalize_sql(policy)?;
                    let passed: Option<bool> = self
                        .conn
                        .query_row(&sql, [], |row| row.get::<_, Option<bool>>(0))
                        .ok()
                        .flatten();
                    match passed {
                        Some(true) => None,
                        _ => Some(aggregate::violation_message(policy)),
                    }
                }
            };
            results.insert(policy.id().to_string(), verdict);
        }
        Ok(results)
    }

    // ---- violation resolution ----------------------------------------------

    /// Drain rows the engine streamed since the last drain and offer each
    /// to the resolver, trying every registered HUMAN/LLM policy context in
    /// registration order. Repaired rows are appended back to the stream
    /// file. Returns the number of repairs.
    pub fn resolve_violations(&mut self) -> Result<usize, RewriterError> {
        let Some(resolver) = self.resolver.as_deref() else {
            return Ok(0);
        };
        let pending = self.stream.drain_new()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let contexts: Vec<(String, Option<String>)> = self
            .registry
            .policies()
            .iter()
            .filter(|p| p.action().is_resolver())
            .map(|p| {
                (
                    p.constraint().to_string(),
                    p.description().map(str::to_string),
                )
            })
            .collect();

        let mut repaired_rows = Vec::new();
        for violation in &pending {
            for (constraint, description) in &contexts {
                if let Some(repaired) =
                    resolver.resolve(violation, constraint, description.as_deref())
                {
                    repaired_rows.push(repaired);
                    break;
                }
            }
        }

        let count = repaired_rows.len();
        for row in repaired_rows {
            self.stream.append_row(&row)?;
        }
        // Repairs we just appended should not come back on the next drain.
        let _ = self.stream.drain_new()?;
        Ok(count)
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Close the engine connection. Dropping the rewriter closes it too;
    /// this form surfaces close errors.
    pub fn close(self) -> Result<(), RewriterError> {
        self.conn.close().map_err(|(_, e)| RewriterError::Engine(e))
    }

    /// Direct connection access for schema setup and inspection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
