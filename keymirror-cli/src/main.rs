//! keymirror: mirror an etcd key prefix onto a directory tree.
//!
//! # Usage
//!
//! ```text
//! keymirror [--config <path>] run
//! keymirror [--config <path>] diff [--json]
//! keymirror [--config <path>] check
//! ```
//!
//! Without a subcommand `run` is assumed. The configuration path falls back
//! to `$KEYMIRROR_CONFIG_FILE`, then `config.yml`.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, diff::DiffArgs, run::RunArgs};
use keymirror_core::config::{CONFIG_FILE_ENV, DEFAULT_CONFIG_FILE};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "keymirror",
    version,
    about = "Mirror an etcd key prefix onto the filesystem and push changes to gRPC listeners",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, env = CONFIG_FILE_ENV, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the mirror, then follow the prefix until stopped.
    Run(RunArgs),

    /// Show what a reconcile would change, without touching anything.
    Diff(DiffArgs),

    /// Load and validate the configuration.
    Check(CheckArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => args.run(&cli.config),
        Commands::Diff(args) => args.run(&cli.config),
        Commands::Check(args) => args.run(&cli.config),
    }
}
