//! Violation resolution capability
//!
//! HUMAN and LLM policies route violating rows into an append-only TSV
//! stream file instead of silently dropping them. What happens next is the
//! resolver's business: a human operator tails the file, or an LLM-backed
//! [`ViolationResolver`] proposes repaired rows, which are appended back to
//! the same file. The core stays ignorant of any model client.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A row captured by `address_violating_rows`, values as rendered text
/// (`NULL` for SQL NULL, booleans lowercase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub columns: Vec<String>,
}

/// Decides what to do with a violating row. Implementations may consult an
/// operator, a model, or nothing at all; returning `None` leaves the row
/// unrepaired.
pub trait ViolationResolver {
    fn resolve(
        &self,
        violation: &Violation,
        constraint: &str,
        description: Option<&str>,
    ) -> Option<Vec<String>>;
}

/// The append-only TSV side channel shared by the engine UDF and the
/// resolver loop. Tracks how far it has read so each drain only sees rows
/// appended since the previous one.
#[derive(Debug)]
pub struct StreamFile {
    path: PathBuf,
    drained: u64,
}

impl StreamFile {
    /// A fresh temp-file-backed stream. The file outlives the handle; the
    /// path is handed to the engine inside rewritten SQL.
    pub fn new_temp() -> std::io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("dfc-stream-")
            .suffix(".tsv")
            .tempfile()?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(Self { path, drained: 0 })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            drained: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, flushed and fsynced so readers never observe a torn
    /// line after the writing query completes.
    pub fn append_row(&self, values: &[String]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = values.join("\t");
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Rows appended since the last drain. Rows appended here afterwards
    /// (repairs) are seen by the next drain, so callers should drain before
    /// appending.
    pub fn drain_new(&mut self) -> std::io::Result<Vec<Violation>> {
        let Ok(mut file) = File::open(&self.path) else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(self.drained))?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)?;

        // Only consume complete lines; a partial tail stays for next time.
        let consumed = match buffer.rfind('\n') {
            Some(last_newline) => last_newline + 1,
            None => 0,
        };
        let complete = &buffer[..consumed];
        self.drained += consumed as u64;

        Ok(complete
            .lines()
            .map(|line| Violation {
                columns: line.split('\t').map(str::to_string).collect(),
            })
            .collect())
    }
}
