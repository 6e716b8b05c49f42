//! pmkv CLI
//!
//! Command-line tools for pmkv pool files.
//!
//! # Commands
//!
//! - `inspect` - Display the pool header and store statistics
//! - `verify` - Check the heap, the engine structure and every record
//! - `dump` - Print stored entries for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// pmkv command-line pool tools.
#[derive(Parser)]
#[command(name = "pmkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the pool file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the pool header and store statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify pool integrity
    Verify,

    /// Print stored entries
    Dump {
        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print keys and values as hex
        #[arg(long)]
        hex: bool,
    },

    /// Show version information
    Version,
}

/// Errors reported by the CLI itself.
#[derive(Debug, Error)]
pub enum CliError {
    /// The command needs `--path`.
    #[error("pool path required for {0}")]
    MissingPath(&'static str),

    /// `--format` named an unknown format.
    #[error("unknown output format: {0} (expected text or json)")]
    UnknownFormat(String),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or(CliError::MissingPath("inspect"))?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or(CliError::MissingPath("verify"))?;
            commands::verify::run(&path)?;
        }
        Commands::Dump { limit, hex } => {
            let path = cli.path.ok_or(CliError::MissingPath("dump"))?;
            commands::dump::run(&path, limit, hex)?;
        }
        Commands::Version => {
            println!("pmkv CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("pmkv core v{}", pmkv_core::VERSION);
            println!(
                "pool format v{}.{}",
                pmkv_core::FORMAT_MAJOR,
                pmkv_core::FORMAT_MINOR
            );
            for engine in pmkv_core::engines() {
                println!("  {:<6} {}", engine.name, engine.description);
            }
        }
    }

    Ok(())
}
