//! Migraph Command-Line Interface
//!
//! Collects, plans, applies, and inspects project migrations.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Migraph Command-Line Interface
#[derive(Parser, Debug)]
#[command(name = "migraph")]
#[command(version, about = "Project migration graph tool")]
pub struct Args {
    /// Directory holding per-app migrations (<dir>/<app>/<name>.json)
    #[arg(long, default_value = "migrations")]
    pub apps_dir: PathBuf,

    /// Directory for collected pending migrations
    #[arg(long, default_value = "pending_migrations")]
    pub pending_dir: PathBuf,

    /// File recording the applied migration set
    #[arg(long, default_value = "applied_migrations.json")]
    pub state: PathBuf,

    /// Apps whose migrations are managed at the project level
    #[arg(long, value_delimiter = ',')]
    pub project_apps: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect unapplied migrations into consolidated pending units
    Collect {
        /// Do not try to optimize the squashed operations
        #[arg(long)]
        no_optimize: bool,
    },
    /// Show the execution plan for the given targets
    Plan {
        /// Targets: `app.name`, `app` (app's leaf), or `app.zero` (unapply
        /// the whole app); defaults to every leaf
        targets: Vec<String>,
    },
    /// Apply the collected pending migrations
    Apply {
        /// Unapply the pending migrations instead
        #[arg(long)]
        unapply: bool,
    },
    /// Show each migration and whether it is applied
    Status,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("migraph=info".parse().expect("valid directive")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = commands::run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
