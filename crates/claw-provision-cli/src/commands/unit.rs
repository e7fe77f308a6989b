//! Single-secret commands.

use std::io::Write;

use claw_provision::{ProvisionConfig, ProvisionReport, Provisioner};

use crate::error::CliError;
use crate::output::OutputFormat;

/// Place command executor.
pub struct PlaceCommand {
    config: ProvisionConfig,
}

impl PlaceCommand {
    /// Create a new place command.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Place the secret `name` and print the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unknown, on configuration problems,
    /// or if output fails.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        name: &str,
    ) -> Result<ProvisionReport, CliError> {
        let provisioner = Provisioner::new(self.config.clone())?;
        let report = provisioner.place_one(name).await?;
        format.write(writer, &report)?;
        Ok(report)
    }
}

/// Remove command executor.
pub struct RemoveCommand {
    config: ProvisionConfig,
}

impl RemoveCommand {
    /// Create a new remove command.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Remove the secret `name` and print the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unknown, on configuration problems,
    /// or if output fails.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        name: &str,
    ) -> Result<ProvisionReport, CliError> {
        let provisioner = Provisioner::new(self.config.clone())?;
        let report = provisioner.remove_one(name)?;
        format.write(writer, &report)?;
        Ok(report)
    }
}
