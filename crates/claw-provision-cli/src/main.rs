//! `claw-provision` binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use claw_provision_cli::cli::{Cli, Commands};
use claw_provision_cli::commands::{
    load_config, PlaceCommand, PlanCommand, RemoveCommand, RunCommand, TeardownCommand,
};
use claw_provision_cli::output::OutputFormat;

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, claw_provision_cli::CliError> {
    let format = OutputFormat::new(cli.format);
    let config = load_config(&cli.config, cli.dry_run)?;
    let mut stdout = io::stdout().lock();

    let report = match cli.command {
        Commands::Plan => {
            PlanCommand::new(config).execute(&mut stdout, &format)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Run => RunCommand::new(config).execute(&mut stdout, &format).await?,
        Commands::Place { name } => {
            PlaceCommand::new(config)
                .execute(&mut stdout, &format, &name)
                .await?
        }
        Commands::Remove { name } => {
            RemoveCommand::new(config).execute(&mut stdout, &format, &name)?
        }
        Commands::Teardown => TeardownCommand::new(config).execute(&mut stdout, &format)?,
    };

    Ok(ExitCode::from(report.exit_code()))
}
