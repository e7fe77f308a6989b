//! Provisioning run reports.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::types::SecretDescriptor;

/// Non-fatal conditions recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionWarning {
    /// A user has no encrypted secondary manifest.
    SecondaryManifestMissing {
        /// Owning user.
        user: String,
        /// Expected ciphertext path.
        path: PathBuf,
    },
    /// A secondary-manifest entry has no ciphertext.
    EntryMissing {
        /// Owning user.
        user: String,
        /// Entry name.
        entry: String,
        /// Expected ciphertext path.
        path: PathBuf,
    },
}

impl fmt::Display for ProvisionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecondaryManifestMissing { user, path } => {
                write!(f, "no secondary manifest for user '{user}' at {}", path.display())
            }
            Self::EntryMissing { user, entry, path } => write!(
                f,
                "secret '{entry}' for user '{user}' missing at {}",
                path.display()
            ),
        }
    }
}

/// Final status of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Plaintext in place.
    Placed,
    /// Unit failed; see the error.
    Failed,
    /// Unit never started (cancelled run).
    Skipped,
    /// Target removed.
    Removed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Placed => "placed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

/// Status of one secondary-manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Placed.
    Placed,
    /// Ciphertext absent; recorded as a warning.
    Missing,
    /// Placement failed.
    Failed,
}

/// Outcome of one secondary-manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOutcome {
    /// Entry name from the secondary manifest.
    pub name: String,
    /// Ciphertext path.
    pub source: PathBuf,
    /// Path written, when placed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Status.
    pub status: EntryStatus,
    /// Error message, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryOutcome {
    /// A placed entry.
    #[must_use]
    pub fn placed(name: impl Into<String>, source: PathBuf, target: PathBuf) -> Self {
        Self {
            name: name.into(),
            source,
            target: Some(target),
            status: EntryStatus::Placed,
            error: None,
        }
    }

    /// An entry whose ciphertext is absent.
    #[must_use]
    pub fn missing(name: impl Into<String>, source: PathBuf) -> Self {
        Self {
            name: name.into(),
            source,
            target: None,
            status: EntryStatus::Missing,
            error: None,
        }
    }

    /// A failed entry.
    #[must_use]
    pub fn failed(name: impl Into<String>, source: PathBuf, error: &ProvisionError) -> Self {
        Self {
            name: name.into(),
            source,
            target: None,
            status: EntryStatus::Failed,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOutcome {
    /// Descriptor name.
    pub name: String,
    /// Descriptor phase.
    pub phase: u32,
    /// Final status.
    pub status: UnitStatus,
    /// Path written or removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Machine-readable error kind (see [`ProvisionError::kind`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Human-readable error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Warnings raised by the unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ProvisionWarning>,
    /// Per-entry outcomes for expansion units.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<EntryOutcome>,
    /// When the unit finished.
    pub finished_at: DateTime<Utc>,
}

impl UnitOutcome {
    fn new(descriptor: &SecretDescriptor, status: UnitStatus) -> Self {
        Self {
            name: descriptor.name.clone(),
            phase: descriptor.phase,
            status,
            target: None,
            error_kind: None,
            error: None,
            warnings: Vec::new(),
            entries: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// A placed unit.
    #[must_use]
    pub fn placed(descriptor: &SecretDescriptor, target: PathBuf) -> Self {
        Self {
            target: Some(target),
            ..Self::new(descriptor, UnitStatus::Placed)
        }
    }

    /// A failed unit.
    #[must_use]
    pub fn failed(descriptor: &SecretDescriptor, error: &ProvisionError) -> Self {
        Self {
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
            ..Self::new(descriptor, UnitStatus::Failed)
        }
    }

    /// A unit that never started.
    #[must_use]
    pub fn skipped(descriptor: &SecretDescriptor) -> Self {
        let error = ProvisionError::Cancelled;
        Self {
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
            ..Self::new(descriptor, UnitStatus::Skipped)
        }
    }

    /// A removed unit.
    #[must_use]
    pub fn removed(descriptor: &SecretDescriptor, target: PathBuf) -> Self {
        Self {
            target: Some(target),
            ..Self::new(descriptor, UnitStatus::Removed)
        }
    }

    /// Attaches warnings.
    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<ProvisionWarning>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Attaches entry outcomes.
    #[must_use]
    pub fn with_entries(mut self, entries: Vec<EntryOutcome>) -> Self {
        self.entries = entries;
        self
    }

    /// Returns true if the unit or any of its entries failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == UnitStatus::Failed
            || self.entries.iter().any(|e| e.status == EntryStatus::Failed)
    }
}

/// Result of a provisioning run, teardown or single-unit operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReport {
    /// Whether writes were redirected to the sandbox.
    pub dry_run: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// One outcome per unit, in execution order.
    pub units: Vec<UnitOutcome>,
}

impl ProvisionReport {
    /// Creates an empty report starting now.
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            dry_run,
            started_at: now,
            finished_at: now,
            units: Vec::new(),
        }
    }

    /// Records an outcome.
    pub fn push(&mut self, outcome: UnitOutcome) {
        self.units.push(outcome);
    }

    /// Stamps the finish time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Returns the outcome for `name`.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Number of units with `status`.
    #[must_use]
    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// Every warning raised during the run.
    pub fn warnings(&self) -> impl Iterator<Item = &ProvisionWarning> {
        self.units.iter().flat_map(|u| u.warnings.iter())
    }

    /// Returns true if any unit or entry failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.units.iter().any(UnitOutcome::is_failure)
    }

    /// Returns true if cancellation left any unit unstarted.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.units.iter().any(|u| u.status == UnitStatus::Skipped)
    }

    /// Process exit code: 0 on success, 1 if anything failed or the run was
    /// cancelled before every unit started.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(self.has_failures() || self.was_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityRef;

    fn descriptor(name: &str) -> SecretDescriptor {
        SecretDescriptor::new(name, "/s/a.age", "/run/a", IdentityRef::master("/m"))
    }

    #[test]
    fn empty_report_succeeds() {
        let report = ProvisionReport::new(false);
        assert!(!report.has_failures());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn failed_unit_sets_exit_code() {
        let mut report = ProvisionReport::new(false);
        report.push(UnitOutcome::placed(&descriptor("a"), PathBuf::from("/run/a")));
        report.push(UnitOutcome::failed(
            &descriptor("b"),
            &ProvisionError::blocked_by("role-key-web"),
        ));
        assert!(report.has_failures());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.count(UnitStatus::Placed), 1);
        assert_eq!(
            report.unit("b").and_then(|u| u.error_kind.as_deref()),
            Some("dependency_blocked")
        );
    }

    #[test]
    fn failed_entry_is_a_failure() {
        let outcome = UnitOutcome::placed(&descriptor("user-secrets-alice"), PathBuf::from("/run"))
            .with_entries(vec![EntryOutcome::failed(
                "TOKEN",
                PathBuf::from("/s/x.age"),
                &ProvisionError::Decrypt("bad".into()),
            )]);
        assert!(outcome.is_failure());
    }

    #[test]
    fn warnings_are_not_failures() {
        let mut report = ProvisionReport::new(true);
        report.push(
            UnitOutcome::placed(&descriptor("user-secrets-alice"), PathBuf::from("/run"))
                .with_warnings(vec![ProvisionWarning::SecondaryManifestMissing {
                    user: "alice".into(),
                    path: PathBuf::from("/s/users/alice/secrets.json.age"),
                }]),
        );
        assert!(!report.has_failures());
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn skipped_records_cancellation() {
        let outcome = UnitOutcome::skipped(&descriptor("a"));
        assert_eq!(outcome.status, UnitStatus::Skipped);
        assert_eq!(outcome.error_kind.as_deref(), Some("cancelled"));
        assert!(!outcome.is_failure());
    }

    #[test]
    fn cancelled_report_exits_non_zero() {
        let mut report = ProvisionReport::new(false);
        report.push(UnitOutcome::placed(&descriptor("a"), PathBuf::from("/run/a")));
        report.push(UnitOutcome::skipped(&descriptor("b")));
        assert!(!report.has_failures());
        assert!(report.was_cancelled());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn serializes_snake_case() {
        let outcome = UnitOutcome::failed(&descriptor("a"), &ProvisionError::Timeout(3));
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error_kind"], "timeout");
        assert!(json.get("entries").is_none());
    }
}
