//! Results Commands

use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;
use kite_common::db::{ResultRow, RunRow};
use kite_common::ResultStore;
use serde::Serialize;

use crate::output::{print_list, status_cell, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ResultsCommands {
    /// List recorded runs
    List,

    /// Show the per-tuple results of a run
    Show {
        /// Run ID
        run_id: String,

        /// Print the full result envelopes
        #[arg(long)]
        envelopes: bool,
    },
}

#[derive(Serialize)]
pub struct RunDisplay(pub RunRow);

impl TableDisplay for RunDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Run", "Test", "State", "Total", "Passed", "Failed", "Started"]
    }

    fn row(&self) -> Vec<String> {
        let run = &self.0;
        vec![
            run.id.clone(),
            run.test_name.clone(),
            run.state.clone(),
            run.total.to_string(),
            run.passed.to_string(),
            run.failed.to_string(),
            format_timestamp(run.started_at),
        ]
    }
}

#[derive(Serialize)]
pub struct ResultDisplay(pub ResultRow);

impl TableDisplay for ResultDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tuple", "Status", "Time", "Payload"]
    }

    fn row(&self) -> Vec<String> {
        let result = &self.0;
        let payload = result
            .envelope
            .pointer("/result/payload")
            .map(|p| p.to_string())
            .unwrap_or_default();
        vec![
            result.tuple_id.to_string(),
            status_cell(&result.outcome),
            format!("{}ms", result.time_taken_ms),
            payload.chars().take(60).collect(),
        ]
    }
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

pub fn execute(cmd: ResultsCommands, db: &Path, format: OutputFormat) -> Result<()> {
    if !db.exists() {
        bail!("No result database at {}", db.display());
    }
    let store = ResultStore::open(db)?;

    match cmd {
        ResultsCommands::List => {
            let runs: Vec<RunDisplay> = store.list_runs()?.into_iter().map(RunDisplay).collect();
            print_list(&runs, format);
        }
        ResultsCommands::Show { run_id, envelopes } => {
            if store.get_run(&run_id)?.is_none() {
                bail!("Run not found: {}", run_id);
            }
            let results = store.list_results(&run_id)?;
            if envelopes {
                let bodies: Vec<_> = results.iter().map(|r| &r.envelope).collect();
                println!("{}", serde_json::to_string_pretty(&bodies)?);
            } else {
                let rows: Vec<ResultDisplay> = results.into_iter().map(ResultDisplay).collect();
                print_list(&rows, format);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_show_missing_run() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("results.db");
        ResultStore::open(&db).unwrap();

        let cmd = ResultsCommands::Show {
            run_id: "nope".to_string(),
            envelopes: false,
        };
        assert!(execute(cmd, &db, OutputFormat::Plain).is_err());
    }

    #[test]
    fn test_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("absent.db");
        assert!(execute(ResultsCommands::List, &db, OutputFormat::Table).is_err());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }
}
