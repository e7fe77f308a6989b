//! Full provisioning run.
//!
//! Runs every phase, writes readiness markers as barriers fire, and cancels
//! not-yet-started units on Ctrl-C.

use std::io::Write;

use claw_provision::{ProvisionConfig, ProvisionReport, Provisioner};
use tracing::warn;

use crate::commands::ready_markers;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Run command executor.
pub struct RunCommand {
    config: ProvisionConfig,
}

impl RunCommand {
    /// Create a new run command.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Execute the run and print the report.
    ///
    /// # Errors
    ///
    /// Returns an error on configuration problems or if output fails. Unit
    /// failures are reported, not returned.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<ProvisionReport, CliError> {
        let report = self.provision().await?;
        format.write(writer, &report)?;
        Ok(report)
    }

    /// Run provisioning without printing.
    ///
    /// # Errors
    ///
    /// Returns an error on configuration problems or marker IO failures.
    pub async fn provision(&self) -> Result<ProvisionReport, CliError> {
        let provisioner = Provisioner::new(self.config.clone())?;

        let follower = match ready_markers(&self.config) {
            Some(markers) => {
                markers.clear()?;
                let rx = provisioner.subscribe();
                Some(tokio::spawn(async move { markers.follow(rx).await }))
            }
            None => None,
        };

        let token = provisioner.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling units not yet started");
                token.cancel();
            }
        });

        let result = provisioner.run().await;
        interrupt.abort();
        // Closes the barrier channel so the follower stops after a cancelled run.
        drop(provisioner);

        match (result, follower) {
            (Ok(report), Some(follower)) => {
                follower
                    .await
                    .map_err(|e| CliError::Command(format!("marker task failed: {e}")))??;
                Ok(report)
            }
            (Ok(report), None) => Ok(report),
            (Err(e), follower) => {
                if let Some(follower) = follower {
                    follower.abort();
                }
                Err(e.into())
            }
        }
    }
}
