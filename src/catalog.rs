//! Table/column catalog
//!
//! Answers existence and type questions about tables by querying the
//! engine's `information_schema`, caching per rewriter instance. Lookups
//! are case-insensitive; names are normalized to lowercase at this
//! boundary. Column order is preserved (INSERT statements without a column
//! list map SELECT outputs to sink columns positionally).

use duckdb::Connection;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Lowercased column name.
    pub name: String,
    /// Uppercased data type, e.g. `BOOLEAN`, `INTEGER`.
    pub data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.data_type.as_str())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    cache: HashMap<String, TableSchema>,
}

const SCHEMA: &str = "main";

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a table, querying the engine on a cache miss. Returns `None`
    /// when the table does not exist (or the engine cannot be queried;
    /// callers treat both as "not bindable").
    pub fn table(&mut self, conn: &Connection, name: &str) -> Option<&TableSchema> {
        let key = name.to_lowercase();
        if !self.cache.contains_key(&key) {
            let schema = query_table_schema(conn, &key)?;
            self.cache.insert(key.clone(), schema);
        }
        self.cache.get(&key)
    }

    /// Cached-only lookup. `transform` performs no I/O, so it sees exactly
    /// the tables that policy registration has already bound.
    pub fn cached(&self, name: &str) -> Option<&TableSchema> {
        self.cache.get(&name.to_lowercase())
    }

    /// Drop a cached entry (used after DDL invalidates it).
    pub fn invalidate(&mut self, name: &str) {
        self.cache.remove(&name.to_lowercase());
    }
}

fn query_table_schema(conn: &Connection, table: &str) -> Option<TableSchema> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = ? AND table_name = ?",
            duckdb::params![SCHEMA, table],
            |row| row.get(0),
        )
        .ok();
    exists.as_ref()?;

    let mut stmt = conn
        .prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
        )
        .ok()?;
    let rows = stmt
        .query_map(duckdb::params![SCHEMA, table], |row| {
            Ok(ColumnInfo {
                name: row.get::<_, String>(0)?.to_lowercase(),
                data_type: row.get::<_, String>(1)?.to_uppercase(),
            })
        })
        .ok()?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.ok()?);
    }
    Some(TableSchema { columns })
}
