//! Tessera CLI
//!
//! Command-line tools for Tessera database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display file sizes, record counts and the manifest
//! - `verify` - Check WAL and snapshot checksums
//! - `stats` - Open the database and print its statistics
//! - `compact` - Checkpoint the WAL into the snapshot
//! - `dump-wal` - Dump WAL records for debugging
//! - `backup` - Create, restore, validate and describe backups

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use error::{CliError, CliResult};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Tessera command-line database tools.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of the reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display file sizes, record counts and the manifest
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Verify WAL and snapshot checksums
    Verify {
        /// Check the WAL only
        #[arg(short, long)]
        wal: bool,

        /// Check the snapshot only
        #[arg(short, long)]
        snapshot: bool,
    },

    /// Open the database and print its statistics
    Stats {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Fold the WAL into the snapshot
    Compact {
        /// Show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump WAL records for debugging
    DumpWal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Decode mutation payloads
        #[arg(short, long)]
        mutations: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Backup operations
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Back the database up into a directory
    Create {
        /// Destination directory
        output: PathBuf,
    },

    /// Restore a backup directory into an empty database path
    Restore {
        /// Backup directory
        input: PathBuf,

        /// Remove an existing database at the target first
        #[arg(short, long)]
        force: bool,
    },

    /// Check a backup without restoring it
    Validate {
        /// Backup directory
        input: PathBuf,
    },

    /// Show backup metadata
    Info {
        /// Backup directory
        input: PathBuf,
    },
}

fn run(cli: Cli) -> CliResult<()> {
    let path = cli.path;
    let require = |command: &'static str| path.clone().ok_or(CliError::MissingPath(command));

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&require("inspect")?, format),
        Commands::Verify { wal, snapshot } => {
            let both = !wal && !snapshot;
            commands::verify::run(&require("verify")?, wal || both, snapshot || both)
        }
        Commands::Stats { format } => commands::stats::run(&require("stats")?, format),
        Commands::Compact { dry_run } => commands::compact::run(&require("compact")?, dry_run),
        Commands::DumpWal {
            limit,
            mutations,
            format,
        } => commands::dump_wal::run(&require("dump-wal")?, limit, mutations, format),
        Commands::Backup(BackupCommand::Create { output }) => {
            commands::backup::create(&require("backup create")?, &output)
        }
        Commands::Backup(BackupCommand::Restore { input, force }) => {
            commands::backup::restore(&require("backup restore")?, &input, force)
        }
        Commands::Backup(BackupCommand::Validate { input }) => commands::backup::validate(&input),
        Commands::Backup(BackupCommand::Info { input }) => commands::backup::info(&input),
        Commands::Version => {
            println!("Tessera CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Tessera Core v{}", tessera_core::VERSION);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
