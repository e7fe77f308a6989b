//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/claw-provision/config.toml";

/// Clawbernetes node secret provisioning.
#[derive(Parser, Debug, Clone)]
#[command(name = "claw-provision")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Provisioning configuration file.
    #[arg(short, long, env = "CLAW_PROVISION_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Redirect all writes to the configured dry-run sandbox.
    #[arg(long)]
    pub dry_run: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Provision every secret, phase by phase.
    Run,

    /// Show the phase plan without touching any target.
    Plan,

    /// Provision a single secret.
    ///
    /// The secret's identity file must already be in place. A supervisor
    /// uses this to drive units against its own barriers.
    Place {
        /// Secret name (see `plan`).
        name: String,
    },

    /// Remove a single secret's plaintext.
    Remove {
        /// Secret name (see `plan`).
        name: String,
    },

    /// Remove every secret's plaintext, latest phase first.
    Teardown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["claw-provision", "run"]);
        assert_eq!(cli.format, Format::Table);
        assert!(!cli.dry_run);
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn parses_place_with_globals() {
        let cli = Cli::parse_from([
            "claw-provision",
            "--config",
            "/tmp/provision.toml",
            "--format",
            "json",
            "--dry-run",
            "place",
            "role-key-web",
        ]);
        assert_eq!(cli.config, PathBuf::from("/tmp/provision.toml"));
        assert_eq!(cli.format, Format::Json);
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Commands::Place { ref name } if name == "role-key-web"));
    }

    #[test]
    fn place_requires_name() {
        assert!(Cli::try_parse_from(["claw-provision", "place"]).is_err());
    }
}
