use std::path::PathBuf;

use clap::{Parser, Subcommand};

// ///////////// //
// CLI interface //
// ///////////// //

/// printersync - Watches a Firestore print queue and prints pending PDF jobs on local CUPS printers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file to read instead of ./printersync.toml.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Connection token of the account to serve.
    #[arg(short, long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Poll the queue and print jobs until stopped (default).
    Run,
    /// Lists the printers CUPS reports.
    Printers,
    /// Lists pending jobs without printing them.
    Jobs,
    /// Checks the connection token and exits.
    Connect,
}

impl Cli {
    pub fn selected_command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}
