//! dfc-rewriter CLI
//!
//! Entry point for the command-line tool: load policies from the config,
//! then transform or execute SQL statements against the engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dfc_rewriter::{output, Config, Rewriter};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dfc-rewriter")]
#[command(about = "Data Flow Control SQL rewriter for DuckDB", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dfc-rewriter.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the rewritten form of each statement (reads stdin when no
    /// statements are given)
    Transform { statements: Vec<String> },

    /// Transform, execute, and print result rows as TSV
    Exec { statements: Vec<String> },

    /// List registered policies as JSON
    Policies,

    /// Evaluate aggregate policies against a sink table
    Finalize { sink_table: String },

    /// Offer streamed violations to the resolver (prints the repair count)
    Resolve,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::from_file(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    let mut rewriter = build_rewriter(&config)?;

    match args.command {
        Command::Transform { statements } => {
            for statement in statements_or_stdin(statements)? {
                let rewritten = rewriter
                    .transform_query(&statement)
                    .with_context(|| format!("Failed to transform: {statement}"))?;
                println!("{rewritten}");
            }
        }
        Command::Exec { statements } => {
            for statement in statements_or_stdin(statements)? {
                let rows = rewriter
                    .fetch_all(&statement)
                    .with_context(|| format!("Failed to execute: {statement}"))?;
                if !rows.is_empty() {
                    println!("{}", output::render_rows(&rows));
                }
            }
        }
        Command::Policies => {
            let listing =
                output::render_policies(rewriter.policies(), rewriter.aggregate_policies())?;
            println!("{listing}");
        }
        Command::Finalize { sink_table } => {
            let violations = rewriter
                .finalize_aggregate_policies(&sink_table)
                .with_context(|| format!("Failed to finalize policies for {sink_table}"))?;
            if !violations.is_empty() {
                println!("{}", output::render_violations(&violations));
            }
        }
        Command::Resolve => {
            let repaired = rewriter
                .resolve_violations()
                .context("Failed to resolve violations")?;
            println!("{repaired}");
        }
    }

    Ok(())
}

fn build_rewriter(config: &Config) -> Result<Rewriter> {
    let mut rewriter = match &config.database.path {
        Some(path) => Rewriter::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?,
        None => Rewriter::new().context("Failed to open in-memory database")?,
    };

    if let Some(path) = &config.stream.path {
        rewriter.set_stream_file(path);
    }

    if let Some(path) = &config.policies.file {
        let lines = dfc_rewriter::config::load_policy_lines(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        for line in lines {
            rewriter
                .register_policy_text(&line)
                .with_context(|| format!("Failed to register policy: {line}"))?;
        }
    }

    Ok(rewriter)
}

/// Given statements verbatim, or the whole of stdin split on `;`.
fn statements_or_stdin(statements: Vec<String>) -> Result<Vec<String>> {
    if !statements.is_empty() {
        return Ok(statements);
    }
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;
    Ok(input
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}
