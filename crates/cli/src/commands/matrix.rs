//! Matrix Command

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use kite_common::{KiteConfig, Tuple};
use kite_engine::tuples_for;
use serde::Serialize;

use crate::output::{print_info, print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct MatrixArgs {
    /// Config file (JSON or YAML)
    pub config: PathBuf,

    /// Only show the named test
    #[arg(short, long)]
    pub test: Option<String>,
}

/// One tuple as it would be scheduled
#[derive(Serialize)]
pub struct TupleDisplay {
    pub id: usize,
    pub label: String,
    pub endpoints: Vec<String>,
}

impl From<&Tuple> for TupleDisplay {
    fn from(tuple: &Tuple) -> Self {
        Self {
            id: tuple.id,
            label: tuple.label(),
            endpoints: tuple.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl TableDisplay for TupleDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tuple", "Label", "Endpoints"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.label.clone(),
            self.endpoints.join(", "),
        ]
    }
}

pub fn execute(args: MatrixArgs, format: OutputFormat) -> Result<()> {
    let config = KiteConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    for test in &config.tests {
        if args.test.as_deref().is_some_and(|name| name != test.name) {
            continue;
        }
        let tuples = tuples_for(&config, test)?;
        print_info(&format!(
            "{}: {} tuple(s) of {}{}",
            test.name,
            tuples.len(),
            test.tuple_size,
            if test.permute { ", permuted" } else { "" }
        ));
        let rows: Vec<TupleDisplay> = tuples.iter().map(TupleDisplay::from).collect();
        print_list(&rows, format);
    }
    Ok(())
}
