//! Engine access helpers
//!
//! Thin wrappers over the duckdb driver: opening connections, running
//! statements, and fetching dynamically-typed rows. The scalar user
//! functions the rewritten SQL relies on live in [`udf`].

pub mod udf;

use duckdb::types::Value;
use duckdb::Connection;
use std::path::Path;

pub fn open_in_memory() -> duckdb::Result<Connection> {
    Connection::open_in_memory()
}

pub fn open(path: &Path) -> duckdb::Result<Connection> {
    Connection::open(path)
}

/// Run a statement (or several, separated by `;`) for its side effects.
pub fn execute(conn: &Connection, sql: &str) -> duckdb::Result<()> {
    conn.execute_batch(sql)
}

/// Fetch every row of a query as engine values.
pub fn fetch_all(conn: &Connection, sql: &str) -> duckdb::Result<Vec<Vec<Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let column_count = row.as_ref().column_count();
        let mut record = Vec::with_capacity(column_count);
        for i in 0..column_count {
            record.push(row.get::<_, Value>(i)?);
        }
        out.push(record);
    }
    Ok(out)
}

/// Fetch the first row of a query, if any.
pub fn fetch_one(conn: &Connection, sql: &str) -> duckdb::Result<Option<Vec<Value>>> {
    Ok(fetch_all(conn, sql)?.into_iter().next())
}
