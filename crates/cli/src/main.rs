//! KITE CLI - Main Entry Point

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kite_cli::commands::{matrix, results, run};
use kite_cli::output::{self, print_error};
use kite_engine::ScriptRegistry;

/// KITE - WebRTC browser interoperability matrix tests
#[derive(Parser)]
#[command(name = "kite")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Result database
    #[arg(long, env = "KITE_DB", global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests of a config file
    Run(run::RunArgs),

    /// Show the tuples a config would schedule
    Matrix(matrix::MatrixArgs),

    /// Browse recorded results
    #[command(subcommand)]
    Results(results::ResultsCommands),

    /// List the registered test implementations
    Scripts,

    /// Show version information
    Version,
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let db = cli.db.unwrap_or_else(kite_common::default_db_path);

    let result = match cli.command {
        Commands::Run(args) => run::execute(args, db, cli.format).await,
        Commands::Matrix(args) => matrix::execute(args, cli.format),
        Commands::Results(cmd) => results::execute(cmd, &db, cli.format),
        Commands::Scripts => {
            for name in ScriptRegistry::with_builtins().names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Version => {
            println!("KITE CLI v{}", kite_common::VERSION);
            println!("WebRTC interoperability matrix engine");
            Ok(())
        }
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
