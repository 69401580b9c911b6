//! CLI interface for Wrench
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Wrench maintenance-data assistant
///
/// Answers natural-language questions about maintenance records by querying a
/// relational database and optionally drawing charts from the results.
#[derive(Parser, Debug)]
#[command(name = "wrench")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server
    Serve {
        /// Override the configured bind address
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Ask a single question and print the answer
    Ask {
        /// The question, in the user language
        message: String,

        /// Session id to continue (a new one is created otherwise)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Run system diagnostics
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask_with_session() {
        let cli = Cli::parse_from(["wrench", "ask", "¿Cuántas órdenes?", "--session", "s1", "--json"]);
        assert!(cli.json);
        match cli.command {
            Command::Ask { message, session } => {
                assert_eq!(message, "¿Cuántas órdenes?");
                assert_eq!(session.as_deref(), Some("s1"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["wrench", "serve", "--log", "debug", "--config", "w.toml"]);
        assert_eq!(cli.log.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("w.toml")));
        assert!(matches!(cli.command, Command::Serve { bind: None }));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
