//! # Claw Provision
//!
//! Phased secret provisioning for Clawbernetes nodes:
//!
//! - **Phase 1**: host secrets, role keys and user keys are decrypted with the
//!   node's long-lived master identity
//! - **Phase 2+**: role and user secrets are decrypted with identities placed
//!   by an earlier phase
//! - **Idempotent placement**: stage directory, remove stale target, decrypt,
//!   apply ownership and mode
//! - **Dry run**: every write is redirected under a sandbox that mirrors the
//!   production tree
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_provision::{ProvisionConfig, Provisioner};
//!
//! # async fn provision() -> claw_provision::Result<()> {
//! let mut config = ProvisionConfig::new("/etc/claw-provision/master.key", "/var/lib/claw-provision/secrets");
//! config.roles = vec!["web".to_string()];
//!
//! let provisioner = Provisioner::new(config)?;
//! let report = provisioner.run().await?;
//! assert!(!report.has_failures());
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Considerations
//!
//! - Identity key material and decrypted buffers are zeroized on drop
//! - Debug output for identities is redacted
//! - Plaintext is written atomically; a failed unit leaves no file behind

pub mod config;
pub mod decrypt;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod expander;
pub mod fsops;
pub mod manifest;
pub mod provisioner;
pub mod ready;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use error::{ProvisionError, Result};
pub use types::{
    FileMode, IdentityRef, Layout, Origin, ProvisioningState, SecretDescriptor, UnitAction,
};

pub use config::{DecryptorConfig, ProvisionConfig, SecretEntry};

pub use decrypt::{CommandDecryptor, Decryptor, Identity, Recipient, SealedBoxDecryptor};

pub use executor::{place, remove, ExecMode};

pub use expander::{expand_user_secrets, Expansion, UserSecondaryManifest};

pub use manifest::{load_manifest, Manifest, ManifestEntry};

pub use provisioner::{Provisioner, StateTracker};

pub use ready::ReadyMarkers;

pub use registry::build_descriptors;

pub use report::{
    EntryOutcome, EntryStatus, ProvisionReport, ProvisionWarning, UnitOutcome, UnitStatus,
};

pub use scheduler::{schedule, Barrier, PhaseBarriers, PhaseBatch};
