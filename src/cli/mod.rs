// ABOUTME: CLI argument parsing and command routing for ptygate
//
// Provides command-line interface for:
// - Streaming a command or a Claude chat turn for a tenant (run, chat)
// - One-shot commands and connectivity checks (exec, check)
// - Remote account management (account)
// - Pool and admission counters (stats, config)

pub mod account;
pub mod exec;
pub mod output;
pub mod stream;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Run CLI tools for many tenants on a shared remote host
#[derive(Parser)]
#[command(name = "ptygate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file, applied after the default locations
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Run commands on this machine instead of over SSH
    #[arg(long, global = true)]
    pub local: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Also log to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

/// Output format for commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a command's JSON-lines output for a tenant
    Run(RunArgs),

    /// Run one Claude CLI chat turn for a tenant
    Chat(ChatArgs),

    /// Run a command once and print its collected output
    Exec(ExecArgs),

    /// Check that a connection can be established and used
    Check,

    /// Manage remote Linux accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Show pool and admission counters
    Stats,

    /// Print the effective configuration
    Config,
}

/// Arguments for the run command
#[derive(clap::Args)]
pub struct RunArgs {
    /// Tenant to admit the command under
    #[arg(long)]
    pub tenant: String,

    /// Command line to run remotely
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the chat command
#[derive(clap::Args)]
pub struct ChatArgs {
    /// Tenant to admit the turn under
    #[arg(long)]
    pub tenant: String,

    /// Linux account the CLI runs as
    #[arg(long)]
    pub user: String,

    /// Working directory on the remote host
    #[arg(long)]
    pub cwd: String,

    /// Prompt text
    #[arg(long, short)]
    pub message: String,

    /// Conversation to resume
    #[arg(long)]
    pub session: Option<String>,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,
}

/// Arguments for the exec command
#[derive(clap::Args)]
pub struct ExecArgs {
    /// Command line to run remotely
    pub command: String,

    /// Timeout in seconds (defaults to the pool's exec timeout)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory to run the command in
    #[arg(long)]
    pub cwd: Option<String>,
}

/// Account subcommands
#[derive(Subcommand)]
pub enum AccountCommand {
    /// Check whether an account exists
    Exists { user: String },

    /// Create an account and its workspace
    Create { user: String },

    /// Delete an account and its home directory
    Delete {
        user: String,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "ptygate", "run", "--tenant", "acme", "--", "printf", "%s\\n", "{}",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tenant, "acme");
                assert_eq!(args.command, vec!["printf", "%s\\n", "{}"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["ptygate", "check", "--local", "--format", "json"]).unwrap();
        assert!(cli.local);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Check));
    }

    #[test]
    fn test_account_delete_flags() {
        let cli = Cli::try_parse_from(["ptygate", "account", "delete", "alice", "--yes"]).unwrap();
        match cli.command {
            Commands::Account(AccountCommand::Delete { user, yes }) => {
                assert_eq!(user, "alice");
                assert!(yes);
            }
            _ => panic!("expected account delete"),
        }
    }

    #[test]
    fn test_chat_requires_message() {
        let result = Cli::try_parse_from([
            "ptygate", "chat", "--tenant", "t", "--user", "alice", "--cwd", "/home/alice",
        ]);
        assert!(result.is_err());
    }
}
