//! Teardown command.

use std::io::Write;

use claw_provision::{ProvisionConfig, ProvisionReport, Provisioner};

use crate::commands::ready_markers;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Teardown command executor.
pub struct TeardownCommand {
    config: ProvisionConfig,
}

impl TeardownCommand {
    /// Create a new teardown command.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Remove every secret and readiness marker, then print the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error on configuration problems or if output fails.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<ProvisionReport, CliError> {
        if let Some(markers) = ready_markers(&self.config) {
            markers.clear()?;
        }
        let report = Provisioner::new(self.config.clone())?.teardown()?;
        format.write(writer, &report)?;
        Ok(report)
    }
}
