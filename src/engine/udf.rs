//! Engine-side scalar functions
//!
//! Rewritten SQL calls two functions that must exist on the connection:
//!
//! - `kill() -> BOOLEAN`: always raises; KILL policies wrap their
//!   constraint so the first violating row aborts the whole query;
//! - `address_violating_rows(col1, ..., colN, stream_path) -> BOOLEAN`:
//!   appends the violating row to the stream file as a TSV line (flushed
//!   and fsynced) and returns FALSE so the row is filtered out. All
//!   arguments arrive as VARCHAR; the rewriter casts column values and
//!   renders NULL as the literal string 'NULL'.

use duckdb::core::{DataChunkHandle, LogicalTypeId};
use duckdb::ffi::duckdb_string_t;
use duckdb::types::DuckString;
use duckdb::vscalar::{ScalarFunctionSignature, VScalar};
use duckdb::Connection;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write;

pub const KILL_MESSAGE: &str = "KILLing due to dfc policy violation";

struct KillFunction;

impl VScalar for KillFunction {
    type State = ();

    unsafe fn invoke(
        _: &Self::State,
        _input: &mut DataChunkHandle,
        _output: &mut dyn duckdb::vtab::arrow::WritableVector,
    ) -> Result<(), Box<dyn Error>> {
        Err(KILL_MESSAGE.into())
    }

    fn signatures() -> Vec<ScalarFunctionSignature> {
        vec![ScalarFunctionSignature::exact(
            vec![],
            LogicalTypeId::Boolean.into(),
        )]
    }
}

struct AddressViolatingRows;

impl VScalar for AddressViolatingRows {
    type State = ();

    unsafe fn invoke(
        _: &Self::State,
        input: &mut DataChunkHandle,
        output: &mut dyn duckdb::vtab::arrow::WritableVector,
    ) -> Result<(), Box<dyn Error>> {
        let row_count = input.len();
        let column_count = input.num_columns();

        // Last argument is the stream file path, the rest are row values.
        let mut columns: Vec<Vec<String>> = Vec::with_capacity(column_count);
        for col in 0..column_count {
            let vector = input.flat_vector(col);
            let raw = vector.as_slice_with_len::<duckdb_string_t>(row_count);
            let values: Vec<String> = raw
                .iter()
                .map(|s| DuckString::new(&mut { *s }).as_str().to_string())
                .collect();
            columns.push(values);
        }

        for row in 0..row_count {
            let Some(path) = columns.last().map(|c| c[row].clone()) else {
                continue;
            };
            if path.is_empty() {
                continue;
            }
            let fields: Vec<&str> = columns[..column_count.saturating_sub(1)]
                .iter()
                .map(|c| c[row].as_str())
                .collect();
            append_stream_line(&path, &fields)?;
        }

        let mut flat = output.flat_vector();
        let verdicts = flat.as_mut_slice::<bool>();
        for verdict in verdicts.iter_mut().take(row_count) {
            *verdict = false;
        }
        Ok(())
    }

    fn signatures() -> Vec<ScalarFunctionSignature> {
        vec![ScalarFunctionSignature::variadic(
            LogicalTypeId::Varchar.into(),
            LogicalTypeId::Boolean.into(),
        )]
    }
}

/// One TSV line per violation, appended and forced to disk so an external
/// consumer sees complete rows once the query finishes.
fn append_stream_line(path: &str, fields: &[&str]) -> Result<(), Box<dyn Error>> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = fields.join("\t");
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Register both functions on the connection. Registration is per
/// connection; separate rewriters are independent.
pub fn register_all(conn: &Connection) -> duckdb::Result<()> {
    conn.register_scalar_function::<KillFunction>("kill")?;
    conn.register_scalar_function::<AddressViolatingRows>("address_violating_rows")?;
    Ok(())
}
