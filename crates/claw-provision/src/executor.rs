//! Decrypt-and-place executor.
//!
//! [`place`] is the idempotent unit of work. It keeps no state between calls:
//! running it twice with the same inputs leaves the same file behind.
//!
//! In dry-run mode every write is redirected under a sandbox directory that
//! mirrors the production tree, and ownership changes are logged instead of
//! applied.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::decrypt::Decryptor;
use crate::error::{ProvisionError, Result};
use crate::fsops::{self, Ownership};
use crate::types::{FileMode, IdentityRef, SecretDescriptor};

/// Mode for directories created in production.
pub const PRODUCTION_DIR_MODE: FileMode = FileMode::from_bits_masked(0o750);

/// Mode for directories created in a dry-run sandbox.
pub const DRY_RUN_DIR_MODE: FileMode = FileMode::from_bits_masked(0o700);

/// Mode for every file written in a dry-run sandbox.
pub const DRY_RUN_FILE_MODE: FileMode = FileMode::OWNER_READ_WRITE;

/// Where placement writes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecMode {
    /// Write to real targets with real ownership.
    Production,
    /// Mirror targets under `sandbox`; never touch real targets.
    DryRun {
        /// Root of the mirrored tree.
        sandbox: PathBuf,
    },
}

impl ExecMode {
    /// Dry-run mode rooted at `sandbox`.
    #[must_use]
    pub fn dry_run(sandbox: impl Into<PathBuf>) -> Self {
        Self::DryRun {
            sandbox: sandbox.into(),
        }
    }

    /// Returns true in dry-run mode.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun { .. })
    }

    /// Maps a production path to the path actually written.
    ///
    /// In dry-run only the normal components of `path` are kept, so the
    /// result always stays under the sandbox.
    #[must_use]
    pub fn effective(&self, path: &Path) -> PathBuf {
        match self {
            Self::Production => path.to_path_buf(),
            Self::DryRun { sandbox } => {
                let mut out = sandbox.clone();
                for component in path.components() {
                    if let Component::Normal(part) = component {
                        out.push(part);
                    }
                }
                out
            }
        }
    }

    /// Path of the identity file used to decrypt.
    ///
    /// The master identity is only ever read, so it is used in place.
    /// Produced identities were written by an earlier unit and therefore
    /// live wherever that unit wrote.
    #[must_use]
    pub fn identity_path(&self, identity: &IdentityRef) -> PathBuf {
        match identity {
            IdentityRef::Master { path } => path.clone(),
            IdentityRef::Produced { path, .. } => self.effective(path),
        }
    }
}

/// Ensures the parent of `target` exists, giving a newly created directory
/// the descriptor's ownership.
fn stage_parent(
    descriptor: &SecretDescriptor,
    target: &Path,
    mode: &ExecMode,
    ownership: Option<&Ownership>,
) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Err(ProvisionError::Config(format!(
            "target '{}' has no parent directory",
            target.display()
        )));
    };
    stage_dir(descriptor, parent, mode, ownership)
}

/// Ensures `dir` exists, giving it the descriptor's ownership if created.
pub(crate) fn stage_dir(
    descriptor: &SecretDescriptor,
    dir: &Path,
    mode: &ExecMode,
    ownership: Option<&Ownership>,
) -> Result<()> {
    let dir_mode = if mode.is_dry_run() {
        DRY_RUN_DIR_MODE
    } else {
        PRODUCTION_DIR_MODE
    };
    if !fsops::ensure_dir(dir, dir_mode)? {
        return Ok(());
    }
    match ownership {
        Some(ownership) => ownership.apply(dir)?,
        None => debug!(
            dir = %dir.display(),
            owner = %descriptor.owner,
            group = descriptor.group.as_deref().unwrap_or("<primary>"),
            mode = %PRODUCTION_DIR_MODE,
            "dry run: would set directory ownership"
        ),
    }
    Ok(())
}

/// Resolves ownership in production; `None` in dry-run.
pub(crate) fn resolve_ownership(
    descriptor: &SecretDescriptor,
    mode: &ExecMode,
) -> Result<Option<Ownership>> {
    if mode.is_dry_run() {
        return Ok(None);
    }
    Ownership::resolve(&descriptor.owner, descriptor.group.as_deref()).map(Some)
}

/// Decrypts `descriptor.source` to its effective target and applies final
/// ownership and mode. Returns the path written.
///
/// Steps, in order:
/// 1. Resolve the identity file; a missing produced identity fails with
///    [`ProvisionError::DependencyBlocked`] before anything is touched.
/// 2. Create the parent directory if needed.
/// 3. Remove any existing file at the target.
/// 4. Decrypt.
/// 5. Apply owner, group and mode. If this fails the plaintext is removed.
///
/// # Errors
///
/// Returns `DependencyBlocked`, `MissingSource`, `Decrypt`, `Ownership` or
/// `Io` for this descriptor.
pub fn place(
    descriptor: &SecretDescriptor,
    mode: &ExecMode,
    decryptor: &dyn Decryptor,
) -> Result<PathBuf> {
    let identity = mode.identity_path(&descriptor.identity);
    if let Some(producer) = descriptor.identity.producer() {
        if !identity.is_file() {
            return Err(ProvisionError::blocked_by(producer));
        }
    }

    let ownership = resolve_ownership(descriptor, mode)?;
    let target = mode.effective(&descriptor.target);

    stage_parent(descriptor, &target, mode, ownership.as_ref())?;
    if fsops::remove_file(&target)? {
        debug!(name = %descriptor.name, target = %target.display(), "removed stale target");
    }

    if !descriptor.source.is_file() {
        return Err(ProvisionError::missing_source(&descriptor.source));
    }

    decryptor.decrypt(&identity, &descriptor.source, &target)?;

    if let Err(e) = finalize(descriptor, &target, ownership.as_ref()) {
        if let Err(cleanup) = fsops::remove_file(&target) {
            debug!(target = %target.display(), error = %cleanup, "failed to remove plaintext");
        }
        return Err(e);
    }

    info!(
        name = %descriptor.name,
        phase = descriptor.phase,
        target = %target.display(),
        decryptor = decryptor.name(),
        "placed secret"
    );
    Ok(target)
}

fn finalize(
    descriptor: &SecretDescriptor,
    target: &Path,
    ownership: Option<&Ownership>,
) -> Result<()> {
    match ownership {
        Some(ownership) => {
            ownership.apply(target)?;
            // chown clears setuid/setgid, so mode goes last.
            fsops::set_mode(target, descriptor.mode)
        }
        None => {
            fsops::set_mode(target, DRY_RUN_FILE_MODE)?;
            debug!(
                target = %target.display(),
                owner = %descriptor.owner,
                group = descriptor.group.as_deref().unwrap_or("<primary>"),
                mode = %descriptor.mode,
                "dry run: would set ownership"
            );
            Ok(())
        }
    }
}

/// Removes the descriptor's effective target. An absent target is not an
/// error.
///
/// # Errors
///
/// Returns an IO error if the target exists but cannot be removed.
pub fn remove(descriptor: &SecretDescriptor, mode: &ExecMode) -> Result<()> {
    let target = mode.effective(&descriptor.target);
    if fsops::remove_file(&target)? {
        info!(name = %descriptor.name, target = %target.display(), "removed secret");
    } else {
        debug!(name = %descriptor.name, target = %target.display(), "nothing to remove");
    }
    Ok(())
}
