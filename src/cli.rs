//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// peerwire - reliable peer-to-peer messaging for distributed runs
///
/// Discovers the other instances of a run, connects to every one of them
/// and exchanges values through gather and broadcast.
#[derive(Parser, Debug)]
#[command(name = "peerwire")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a run, gather one value from every instance and broadcast the result
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "PEERWIRE_CONFIG")]
        config: Option<String>,

        /// Override the instance name
        #[arg(long)]
        instance_name: Option<String>,

        /// Override the position of this instance on its machine
        #[arg(long)]
        local_position: Option<usize>,

        /// Value contributed to the gather (defaults to the instance name)
        #[arg(long)]
        gather: Option<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Where to create the file (default ~/.peerwire/node.toml)
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["peerwire", "run"]);
        match cli.command {
            Commands::Run {
                instance_name,
                local_position,
                gather,
                ..
            } => {
                assert!(instance_name.is_none());
                assert!(local_position.is_none());
                assert!(gather.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "peerwire",
            "run",
            "--config",
            "/etc/peerwire/node.toml",
            "--instance-name",
            "worker-2",
            "--local-position",
            "2",
            "--gather",
            "hello",
        ]);
        match cli.command {
            Commands::Run {
                config,
                instance_name,
                local_position,
                gather,
            } => {
                assert_eq!(config.as_deref(), Some("/etc/peerwire/node.toml"));
                assert_eq!(instance_name.as_deref(), Some("worker-2"));
                assert_eq!(local_position, Some(2));
                assert_eq!(gather.as_deref(), Some("hello"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["peerwire", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["peerwire", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_config_validate_with_path() {
        let cli = Cli::parse_from(["peerwire", "config", "validate", "-c", "node.toml"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Validate { config },
            } => assert_eq!(config.as_deref(), Some("node.toml")),
            _ => panic!("Expected Config Validate command"),
        }
    }
}
