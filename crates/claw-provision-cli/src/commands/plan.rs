//! Phase plan command.

use std::io::Write;

use claw_provision::{ProvisionConfig, Provisioner};

use crate::error::CliError;
use crate::output::{OutputFormat, Plan};

/// Plan command executor.
pub struct PlanCommand {
    config: ProvisionConfig,
}

impl PlanCommand {
    /// Create a new plan command.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Print the phase plan. Nothing is decrypted or written.
    ///
    /// # Errors
    ///
    /// Returns an error on configuration problems or if output fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let provisioner = Provisioner::new(self.config.clone())?;
        let batches = provisioner.plan()?;
        format.write(writer, &Plan::new(self.config.dry_run, &batches))
    }
}
