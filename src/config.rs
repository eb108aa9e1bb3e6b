//! Configuration file parsing
//!
//! Reads dfc-rewriter.toml configuration files for the CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub policies: PoliciesConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Path to the DuckDB database file. Absent means in-memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PoliciesConfig {
    /// File with one policy DSL entry per line. `#` starts a comment.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Stream file for HUMAN/LLM violations. Absent means a temp file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Read a policy file: one DSL entry per non-empty, non-comment line.
pub fn load_policy_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "analytics.duckdb"

            [policies]
            file = "policies.dfc"

            [stream]
            path = "/tmp/violations.tsv"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.database.path.as_deref(),
            Some(Path::new("analytics.duckdb"))
        );
        assert_eq!(config.policies.file.as_deref(), Some(Path::new("policies.dfc")));
    }

    #[test]
    fn empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.database.path.is_none());
        assert!(config.policies.file.is_none());
        assert!(config.stream.path.is_none());
    }

    #[test]
    fn policy_lines_skip_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.dfc");
        std::fs::write(
            &path,
            "# registered at startup\n\nSOURCE foo CONSTRAINT max(foo.id) > 1 ON FAIL REMOVE\n",
        )
        .unwrap();
        let lines = load_policy_lines(&path).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("SOURCE foo"));
    }
}
