//! Provisioning runs.
//!
//! [`Provisioner`] ties the pieces together: it loads the manifest, discovers
//! ciphertexts, builds and schedules descriptors, then runs each batch on the
//! tokio runtime. Units within a batch run concurrently on the blocking pool.
//! A unit whose identity producer did not place fails with
//! [`ProvisionError::DependencyBlocked`] without decrypting.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;
use crate::decrypt::Decryptor;
use crate::discovery::{discover, Discovered};
use crate::error::{ProvisionError, Result};
use crate::executor::{self, ExecMode};
use crate::expander::{self, expand_user_secrets};
use crate::manifest::{load_manifest, Manifest};
use crate::registry::build_descriptors;
use crate::report::{ProvisionReport, UnitOutcome, UnitStatus};
use crate::scheduler::{schedule, Barrier, PhaseBarriers, PhaseBatch};
use crate::types::{ProvisioningState, SecretDescriptor, UnitAction};

/// In-memory lifecycle state per descriptor.
///
/// The filesystem is the durable record; this only reflects what the current
/// process has done.
#[derive(Debug, Default)]
pub struct StateTracker {
    states: RwLock<HashMap<String, ProvisioningState>>,
}

impl StateTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `name`; unknown names are `Pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, name: &str) -> Result<ProvisioningState> {
        let states = self
            .states
            .read()
            .map_err(|e| ProvisionError::Internal(format!("Failed to acquire lock: {e}")))?;
        Ok(states.get(name).copied().unwrap_or(ProvisioningState::Pending))
    }

    /// Moves `name` to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is illegal or the lock is poisoned.
    pub fn transition(&self, name: &str, next: ProvisioningState) -> Result<ProvisioningState> {
        let mut states = self
            .states
            .write()
            .map_err(|e| ProvisionError::Internal(format!("Failed to acquire lock: {e}")))?;
        let current = states.get(name).copied().unwrap_or(ProvisioningState::Pending);
        if current != next && !current.can_transition_to(next) {
            return Err(ProvisionError::Internal(format!(
                "illegal state transition for '{name}': {current} -> {next}"
            )));
        }
        states.insert(name.to_string(), next);
        Ok(current)
    }

    /// Forces `name` to `state` without checking the transition.
    ///
    /// Used at run start (everything becomes `Pending`) and on removal,
    /// where the target may have been placed by another process.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set(&self, name: &str, state: ProvisioningState) -> Result<()> {
        let mut states = self
            .states
            .write()
            .map_err(|e| ProvisionError::Internal(format!("Failed to acquire lock: {e}")))?;
        states.insert(name.to_string(), state);
        Ok(())
    }

    /// Sorted copy of every tracked state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<BTreeMap<String, ProvisioningState>> {
        let states = self
            .states
            .read()
            .map_err(|e| ProvisionError::Internal(format!("Failed to acquire lock: {e}")))?;
        Ok(states.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }
}

/// Drives provisioning for one host.
#[derive(Debug)]
pub struct Provisioner {
    config: ProvisionConfig,
    decryptor: Arc<dyn Decryptor>,
    states: StateTracker,
    barriers: PhaseBarriers,
    cancel: CancellationToken,
}

impl Provisioner {
    /// Creates a provisioner using the configured decryptor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: ProvisionConfig) -> Result<Self> {
        config.validate()?;
        let decryptor = config.decryptor.build();
        Ok(Self {
            config,
            decryptor,
            states: StateTracker::new(),
            barriers: PhaseBarriers::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the decrypt primitive.
    #[must_use]
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    /// Uses `token` to cancel runs.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Execution mode derived from the configuration.
    #[must_use]
    pub fn mode(&self) -> ExecMode {
        self.config.exec_mode()
    }

    /// Per-descriptor state.
    #[must_use]
    pub fn states(&self) -> &StateTracker {
        &self.states
    }

    /// Token that cancels units not yet started.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to barrier progress.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Barrier> {
        self.barriers.subscribe()
    }

    /// Loads the manifest according to the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ManifestParse`] if the manifest exists but
    /// is invalid.
    pub fn manifest(&self) -> Result<Manifest> {
        let mut manifest = if self.config.auto_configure_from_manifest {
            load_manifest(&self.config.manifest_path())?
        } else {
            Manifest::empty()
        };
        if self.config.ssh_host_keys {
            manifest.enable_ssh_host_keys();
        }
        if self.config.keytab {
            manifest.enable_keytab();
        }
        Ok(manifest)
    }

    /// Builds the validated descriptor set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error; nothing has been decrypted.
    pub fn descriptors(&self) -> Result<Vec<SecretDescriptor>> {
        let layout = self.config.layout();
        let manifest = self.manifest()?;
        let discovered = if self.config.discover {
            discover(&layout, &self.config.roles)?
        } else {
            Discovered::empty()
        };
        build_descriptors(
            &self.config.secrets,
            &manifest,
            &discovered,
            &self.config.roles,
            &self.config.users,
            &layout,
        )
    }

    /// Computes the phase batches without touching any target.
    ///
    /// # Errors
    ///
    /// Returns a configuration error.
    pub fn plan(&self) -> Result<Vec<PhaseBatch>> {
        schedule(self.descriptors()?)
    }

    fn find(&self, name: &str) -> Result<SecretDescriptor> {
        self.descriptors()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))
    }

    /// Runs every phase in order.
    ///
    /// Configuration errors abort before any decryption. Unit failures are
    /// recorded in the report and never abort siblings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, or an internal error if state
    /// tracking fails.
    pub async fn run(&self) -> Result<ProvisionReport> {
        let batches = self.plan()?;
        let mode = self.mode();
        let timeout = self.config.unit_timeout();

        self.barriers.reset();
        for descriptor in batches.iter().flat_map(|b| &b.descriptors) {
            self.states.set(&descriptor.name, ProvisioningState::Pending)?;
        }

        info!(
            phases = batches.len(),
            units = batches.iter().map(PhaseBatch::len).sum::<usize>(),
            dry_run = mode.is_dry_run(),
            "starting provisioning run"
        );

        let mut report = ProvisionReport::new(mode.is_dry_run());
        let mut unplaced: HashSet<String> = HashSet::new();
        let mut interrupted = false;

        for batch in batches {
            let mut tasks = JoinSet::new();
            let mut outcomes = Vec::with_capacity(batch.len());

            for descriptor in batch.descriptors {
                if self.cancel.is_cancelled() {
                    debug!(name = %descriptor.name, "run cancelled, skipping unit");
                    interrupted = true;
                    unplaced.insert(descriptor.name.clone());
                    outcomes.push(UnitOutcome::skipped(&descriptor));
                    continue;
                }
                if let Some(producer) = descriptor.identity.producer() {
                    if unplaced.contains(producer) {
                        let err = ProvisionError::blocked_by(producer);
                        warn!(name = %descriptor.name, error = %err, "unit blocked");
                        self.states.transition(&descriptor.name, ProvisioningState::Failed)?;
                        unplaced.insert(descriptor.name.clone());
                        outcomes.push(UnitOutcome::failed(&descriptor, &err));
                        continue;
                    }
                }

                self.states
                    .transition(&descriptor.name, ProvisioningState::Decrypting)?;
                tasks.spawn(run_unit(
                    descriptor,
                    mode.clone(),
                    Arc::clone(&self.decryptor),
                    timeout,
                ));
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = joined
                    .map_err(|e| ProvisionError::Internal(format!("unit task failed: {e}")))?;
                let state = if outcome.status == UnitStatus::Placed {
                    ProvisioningState::Placed
                } else {
                    unplaced.insert(outcome.name.clone());
                    ProvisioningState::Failed
                };
                self.states.transition(&outcome.name, state)?;
                outcomes.push(outcome);
            }

            outcomes.sort_by(|a, b| a.name.cmp(&b.name));
            report.units.extend(outcomes);
            // A batch with skipped units never resolved; later barriers stay put.
            if !interrupted {
                self.barriers.phase_resolved(batch.phase);
            }
        }

        if interrupted {
            warn!(barrier = %self.barriers.current(), "run cancelled before completion");
        } else {
            self.barriers.complete();
        }
        report.finish();
        info!(
            placed = report.count(UnitStatus::Placed),
            failed = report.count(UnitStatus::Failed),
            skipped = report.count(UnitStatus::Skipped),
            "provisioning run finished"
        );
        Ok(report)
    }

    /// Runs the single unit `name`.
    ///
    /// The unit's identity file must already exist; otherwise the unit
    /// fails with [`ProvisionError::DependencyBlocked`]. This is how a
    /// supervisor drives units against its own barriers.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] or a configuration error.
    pub async fn place_one(&self, name: &str) -> Result<ProvisionReport> {
        let descriptor = self.find(name)?;
        let mode = self.mode();
        let mut report = ProvisionReport::new(mode.is_dry_run());

        if self.cancel.is_cancelled() {
            report.push(UnitOutcome::skipped(&descriptor));
            report.finish();
            return Ok(report);
        }

        self.states.set(name, ProvisioningState::Pending)?;
        self.states.transition(name, ProvisioningState::Decrypting)?;
        let outcome = run_unit(
            descriptor,
            mode,
            Arc::clone(&self.decryptor),
            self.config.unit_timeout(),
        )
        .await;
        let state = if outcome.status == UnitStatus::Placed {
            ProvisioningState::Placed
        } else {
            ProvisioningState::Failed
        };
        self.states.transition(name, state)?;
        report.push(outcome);
        report.finish();
        Ok(report)
    }

    /// Removes the target of the single unit `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] or a configuration error.
    pub fn remove_one(&self, name: &str) -> Result<ProvisionReport> {
        let descriptor = self.find(name)?;
        let mode = self.mode();
        let mut report = ProvisionReport::new(mode.is_dry_run());
        report.push(self.remove_unit(&descriptor, &mode)?);
        report.finish();
        Ok(report)
    }

    /// Removes every unit's target, latest phase first.
    ///
    /// # Errors
    ///
    /// Returns a configuration error.
    pub fn teardown(&self) -> Result<ProvisionReport> {
        let batches = self.plan()?;
        let mode = self.mode();
        let mut report = ProvisionReport::new(mode.is_dry_run());

        for batch in batches.iter().rev() {
            for descriptor in batch.descriptors.iter().rev() {
                report.push(self.remove_unit(descriptor, &mode)?);
            }
        }

        report.finish();
        info!(
            removed = report.count(UnitStatus::Removed),
            failed = report.count(UnitStatus::Failed),
            "teardown finished"
        );
        Ok(report)
    }

    fn remove_unit(&self, descriptor: &SecretDescriptor, mode: &ExecMode) -> Result<UnitOutcome> {
        let removed = match &descriptor.action {
            UnitAction::Place => executor::remove(descriptor, mode),
            UnitAction::ExpandUserManifest { user, .. } => {
                expander::remove_user_secrets(user, &mode.effective(&descriptor.target))
            }
        };

        match removed {
            Ok(()) => {
                self.states.set(&descriptor.name, ProvisioningState::Removed)?;
                Ok(UnitOutcome::removed(
                    descriptor,
                    mode.effective(&descriptor.target),
                ))
            }
            Err(e) => {
                warn!(name = %descriptor.name, error = %e, "failed to remove secret");
                Ok(UnitOutcome::failed(descriptor, &e))
            }
        }
    }
}

/// Runs one unit on the blocking pool and converts the result to an outcome.
async fn run_unit(
    descriptor: SecretDescriptor,
    mode: ExecMode,
    decryptor: Arc<dyn Decryptor>,
    timeout: Option<Duration>,
) -> UnitOutcome {
    let task_descriptor = descriptor.clone();
    let work =
        tokio::task::spawn_blocking(move || execute(&task_descriptor, &mode, decryptor.as_ref()));

    let joined = match timeout {
        // The blocking work itself cannot be interrupted; it finishes in the
        // background and the unit is reported as timed out.
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(joined) => joined,
            Err(_) => {
                let err = ProvisionError::Timeout(limit.as_secs());
                warn!(name = %descriptor.name, error = %err, "unit timed out");
                return UnitOutcome::failed(&descriptor, &err);
            }
        },
        None => work.await,
    };

    match joined {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(
                name = %descriptor.name,
                phase = descriptor.phase,
                kind = e.kind(),
                error = %e,
                "unit failed"
            );
            UnitOutcome::failed(&descriptor, &e)
        }
        Err(e) => {
            let err = ProvisionError::Internal(format!("unit task failed: {e}"));
            warn!(name = %descriptor.name, error = %err, "unit failed");
            UnitOutcome::failed(&descriptor, &err)
        }
    }
}

fn execute(
    descriptor: &SecretDescriptor,
    mode: &ExecMode,
    decryptor: &dyn Decryptor,
) -> Result<UnitOutcome> {
    match &descriptor.action {
        UnitAction::Place => {
            executor::place(descriptor, mode, decryptor).map(|t| UnitOutcome::placed(descriptor, t))
        }
        UnitAction::ExpandUserManifest { .. } => {
            let expansion = expand_user_secrets(descriptor, mode, decryptor)?;
            Ok(
                UnitOutcome::placed(descriptor, mode.effective(&descriptor.target))
                    .with_entries(expansion.entries)
                    .with_warnings(expansion.warnings),
            )
        }
    }
}
