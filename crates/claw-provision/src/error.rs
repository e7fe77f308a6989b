//! Error types for secret provisioning.
//!
//! Errors fall into two groups. Configuration errors (`Config`,
//! `ManifestParse`, `InvalidPhase`, `UnknownIdentity`, `CyclicIdentity`,
//! `DuplicateName`) abort a run before any decryption starts. Every other
//! variant is scoped to the single descriptor that produced it.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors that can occur while provisioning secrets.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// An existing manifest file could not be parsed.
    #[error("failed to parse manifest '{path}': {reason}")]
    ManifestParse {
        /// Path of the manifest file.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// Phase numbering is invalid (zero, or a gap between phases).
    #[error("invalid phase numbering: {0}")]
    InvalidPhase(String),

    /// A descriptor references an identity producer that does not exist.
    #[error("secret '{name}' references unknown identity '{identity}'")]
    UnknownIdentity {
        /// Referencing descriptor.
        name: String,
        /// Name that could not be resolved.
        identity: String,
    },

    /// Identity references form a cycle or point at a same-or-later phase.
    #[error("cyclic identity reference: {0}")]
    CyclicIdentity(String),

    /// Two descriptors from the same source share a name.
    #[error("duplicate secret name: {0}")]
    DuplicateName(String),

    /// The ciphertext for a descriptor does not exist.
    #[error("source not found: {}", path.display())]
    MissingSource {
        /// Expected ciphertext path.
        path: PathBuf,
    },

    /// The identity-producing descriptor failed or never ran.
    #[error("blocked by dependency '{dependency}'")]
    DependencyBlocked {
        /// Name of the identity-producing descriptor.
        dependency: String,
    },

    /// The decrypt primitive rejected the input.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Owner or group could not be resolved or applied.
    #[error("ownership error: {0}")]
    Ownership(String),

    /// A secondary manifest was decrypted but could not be parsed.
    #[error("invalid secondary manifest for user '{user}': {reason}")]
    SecondaryManifest {
        /// Owning user.
        user: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// The unit exceeded its time budget.
    #[error("timed out after {0}s")]
    Timeout(u64),

    /// The run was cancelled before the unit started.
    #[error("cancelled before start")]
    Cancelled,

    /// No descriptor with the given name exists.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// Internal error (lock poisoning, join failures).
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Creates a dependency-blocked error for the named producer.
    #[must_use]
    pub fn blocked_by(dependency: impl Into<String>) -> Self {
        Self::DependencyBlocked {
            dependency: dependency.into(),
        }
    }

    /// Creates a missing-source error.
    #[must_use]
    pub fn missing_source(path: impl Into<PathBuf>) -> Self {
        Self::MissingSource { path: path.into() }
    }

    /// Returns true if this error must abort the whole run.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ManifestParse { .. }
                | Self::InvalidPhase(_)
                | Self::UnknownIdentity { .. }
                | Self::CyclicIdentity(_)
                | Self::DuplicateName(_)
        )
    }

    /// Short machine-readable label used in reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_)
            | Self::ManifestParse { .. }
            | Self::InvalidPhase(_)
            | Self::UnknownIdentity { .. }
            | Self::CyclicIdentity(_)
            | Self::DuplicateName(_) => "configuration",
            Self::MissingSource { .. } => "missing_source",
            Self::DependencyBlocked { .. } => "dependency_blocked",
            Self::Decrypt(_) => "decrypt",
            Self::Ownership(_) => "ownership",
            Self::SecondaryManifest { .. } => "secondary_manifest",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
        }
    }
}
