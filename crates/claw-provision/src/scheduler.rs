//! Phase scheduling and readiness barriers.
//!
//! Descriptors are grouped into [`PhaseBatch`]es in ascending phase order.
//! Units inside a batch are independent; the next batch starts only after
//! every unit of the current one has resolved.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::types::SecretDescriptor;

/// All descriptors of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseBatch {
    /// Phase number.
    pub phase: u32,
    /// Descriptors in name order.
    pub descriptors: Vec<SecretDescriptor>,
}

impl PhaseBatch {
    /// Number of units in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true if the batch has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Groups descriptors by phase, ascending.
///
/// # Errors
///
/// Returns [`ProvisionError::InvalidPhase`] if a phase is 0 or the phases
/// are not dense starting at 1.
pub fn schedule(descriptors: Vec<SecretDescriptor>) -> Result<Vec<PhaseBatch>> {
    let mut sorted = descriptors;
    sorted.sort_by(|a, b| a.phase.cmp(&b.phase).then_with(|| a.name.cmp(&b.name)));

    let mut batches: Vec<PhaseBatch> = Vec::new();
    for descriptor in sorted {
        let expected = match batches.last_mut() {
            Some(batch) if batch.phase == descriptor.phase => {
                batch.descriptors.push(descriptor);
                continue;
            }
            Some(batch) => batch.phase + 1,
            None => 1,
        };
        if descriptor.phase != expected {
            return Err(ProvisionError::InvalidPhase(format!(
                "expected phase {expected}, found phase {} ('{}')",
                descriptor.phase, descriptor.name
            )));
        }
        batches.push(PhaseBatch {
            phase: descriptor.phase,
            descriptors: vec![descriptor],
        });
    }
    Ok(batches)
}

/// Readiness milestones, in the order they fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Barrier {
    /// Nothing resolved yet.
    Pending,
    /// Every phase-1 unit resolved.
    HostSecretsReady,
    /// Every phase-2 unit resolved (or there is no phase 2).
    RoleUserSecretsReady,
    /// Every unit resolved.
    AllSecretsReady,
}

impl Barrier {
    /// Barriers a consumer can wait on, in firing order.
    pub const ALL: [Self; 3] = [
        Self::HostSecretsReady,
        Self::RoleUserSecretsReady,
        Self::AllSecretsReady,
    ];

    /// Marker file name for this barrier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::HostSecretsReady => "host-secrets-ready",
            Self::RoleUserSecretsReady => "role-user-secrets-ready",
            Self::AllSecretsReady => "all-secrets-ready",
        }
    }

    /// Barrier reached once `phase` has resolved.
    #[must_use]
    pub const fn after_phase(phase: u32) -> Self {
        match phase {
            0 => Self::Pending,
            1 => Self::HostSecretsReady,
            _ => Self::RoleUserSecretsReady,
        }
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcasts barrier progress to any number of waiters.
///
/// Barriers fire even when units failed; consumers read the report to
/// decide what that means for them. A cancelled run stops advancing at the
/// last fully resolved phase.
#[derive(Debug)]
pub struct PhaseBarriers {
    tx: watch::Sender<Barrier>,
}

impl Default for PhaseBarriers {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseBarriers {
    /// Creates barriers in the [`Barrier::Pending`] state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Barrier::Pending);
        Self { tx }
    }

    /// Subscribes to barrier changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Barrier> {
        self.tx.subscribe()
    }

    /// Current barrier.
    #[must_use]
    pub fn current(&self) -> Barrier {
        *self.tx.borrow()
    }

    /// Resets to [`Barrier::Pending`] for a new run.
    pub fn reset(&self) {
        self.tx.send_replace(Barrier::Pending);
    }

    /// Advances to `barrier`, firing every barrier in between.
    ///
    /// Moving backwards is ignored. Returns the barriers that fired.
    pub fn advance(&self, barrier: Barrier) -> Vec<Barrier> {
        let current = self.current();
        let fired: Vec<Barrier> = Barrier::ALL
            .into_iter()
            .filter(|b| *b > current && *b <= barrier)
            .collect();
        if !fired.is_empty() {
            for b in &fired {
                info!(barrier = %b, "barrier reached");
            }
            self.tx.send_replace(barrier);
        }
        fired
    }

    /// Records that `phase` resolved. Returns the barriers that fired.
    pub fn phase_resolved(&self, phase: u32) -> Vec<Barrier> {
        self.advance(Barrier::after_phase(phase))
    }

    /// Records that every phase resolved. Returns the barriers that fired.
    pub fn complete(&self) -> Vec<Barrier> {
        self.advance(Barrier::AllSecretsReady)
    }
}

/// Waits until `rx` reports at least `barrier`.
///
/// # Errors
///
/// Returns [`ProvisionError::Internal`] if the sender was dropped first.
pub async fn wait_for(rx: &mut watch::Receiver<Barrier>, barrier: Barrier) -> Result<()> {
    rx.wait_for(|current| *current >= barrier)
        .await
        .map(|_| ())
        .map_err(|_| ProvisionError::Internal(format!("barrier '{barrier}' sender dropped")))
}
