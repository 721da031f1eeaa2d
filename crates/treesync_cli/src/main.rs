//! TreeSync CLI
//!
//! Drives a principal's node tree through a full sync connection against
//! an authority kept next to the local store.
//!
//! # Commands
//!
//! - `add-root` - Append a child to the root
//! - `run-test` - Append children on an interval while printing listener output
//! - `print-nodes` - Print the root and its children
//! - `print-info` - Print the principal, root id and node counts
//! - `reset` - Delete every node of the principal
//! - `inspect` - Dump log statistics of the local store

mod commands;

use clap::{Parser, Subcommand};
use commands::session::Options;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// TreeSync command-line client.
#[derive(Parser)]
#[command(name = "treesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the local store and the authority
    #[arg(global = true, short, long, default_value = "treesync-data")]
    store: PathBuf,

    /// Application id presented to the authority
    #[arg(global = true, long, default_value = "bugfinding-wwwcz")]
    app_id: String,

    /// Principal to sync as (anonymous if omitted)
    #[arg(global = true, short, long)]
    user: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a new child node to the root
    AddRoot {
        /// Text of the new node
        #[arg(short, long, default_value = "a child node")]
        text: String,
    },

    /// Append children to the root at an interval, printing listener output
    RunTest {
        /// Milliseconds between appends
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,

        /// Number of nodes to append
        #[arg(short, long, default_value = "19")]
        count: usize,
    },

    /// Print the root and its children
    PrintNodes,

    /// Print information about the principal's nodes
    PrintInfo,

    /// Delete every node of the principal
    Reset,

    /// Display log statistics of the local store
    Inspect,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = Options {
        store: cli.store,
        app_id: cli.app_id,
        user: cli.user,
        json: cli.format == "json",
    };

    match cli.command {
        Commands::AddRoot { text } => commands::nodes::add_root(&options, &text).await?,
        Commands::RunTest { interval_ms, count } => {
            commands::run_test::run(&options, Duration::from_millis(interval_ms), count).await?;
        }
        Commands::PrintNodes => commands::nodes::print_nodes(&options).await?,
        Commands::PrintInfo => commands::nodes::print_info(&options).await?,
        Commands::Reset => commands::nodes::reset(&options).await?,
        Commands::Inspect => commands::inspect::run(&options)?,
        Commands::Version => {
            println!("TreeSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("TreeSync Core v{}", treesync_core::VERSION);
        }
    }

    Ok(())
}
