//! Filesystem helpers used by the executor.
//!
//! All helpers are synchronous; callers run them on the blocking pool.

use std::fs::{self, DirBuilder, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};

use crate::error::{ProvisionError, Result};
use crate::types::FileMode;

/// Resolved numeric ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    /// Owning user id.
    pub uid: Uid,
    /// Owning group id.
    pub gid: Gid,
}

impl Ownership {
    /// Resolves `owner` and `group` to numeric ids.
    ///
    /// Names and numeric ids are both accepted. A `None` group means the
    /// owner's primary group.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Ownership`] if a name does not resolve.
    pub fn resolve(owner: &str, group: Option<&str>) -> Result<Self> {
        let user = lookup_user(owner)?;
        let gid = match group {
            Some(group) => lookup_group(group)?,
            None => user.gid,
        };
        Ok(Self { uid: user.uid, gid })
    }

    /// Applies this ownership to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Ownership`] if `chown` fails.
    pub fn apply(&self, path: &Path) -> Result<()> {
        nix::unistd::chown(path, Some(self.uid), Some(self.gid)).map_err(|e| {
            ProvisionError::Ownership(format!(
                "chown {}:{} '{}': {e}",
                self.uid,
                self.gid,
                path.display()
            ))
        })
    }
}

fn lookup_user(name: &str) -> Result<User> {
    let found = match name.parse::<u32>() {
        Ok(uid) => User::from_uid(Uid::from_raw(uid)),
        Err(_) => User::from_name(name),
    };
    found
        .map_err(|e| ProvisionError::Ownership(format!("user lookup '{name}': {e}")))?
        .ok_or_else(|| ProvisionError::Ownership(format!("unknown user '{name}'")))
}

fn lookup_group(name: &str) -> Result<Gid> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(Gid::from_raw(gid));
    }
    Group::from_name(name)
        .map_err(|e| ProvisionError::Ownership(format!("group lookup '{name}': {e}")))?
        .map(|g| g.gid)
        .ok_or_else(|| ProvisionError::Ownership(format!("unknown group '{name}'")))
}

/// Mode for missing ancestors created on the way to a secret directory.
///
/// Ancestors must stay traversable so a non-root owner can reach its own
/// leaf directory; only the leaf carries the restrictive mode.
pub const ANCESTOR_DIR_MODE: FileMode = FileMode::from_bits_masked(0o755);

/// Creates `dir` with `mode`, creating missing ancestors with
/// [`ANCESTOR_DIR_MODE`].
///
/// Returns true if `dir` itself was created by this call. Concurrent callers
/// creating the same directory both succeed.
///
/// # Errors
///
/// Returns an IO error if creation fails for any reason other than the
/// directory already existing.
pub fn ensure_dir(dir: &Path, mode: FileMode) -> Result<bool> {
    if dir.is_dir() {
        return Ok(false);
    }
    if let Some(parent) = dir.parent() {
        let missing: Vec<&Path> = parent
            .ancestors()
            .take_while(|a| !a.as_os_str().is_empty() && !a.is_dir())
            .collect();
        for ancestor in missing.into_iter().rev() {
            create_dir(ancestor, ANCESTOR_DIR_MODE)?;
        }
    }
    create_dir(dir, mode)
}

fn create_dir(dir: &Path, mode: FileMode) -> Result<bool> {
    match DirBuilder::new().mode(mode.bits()).create(dir) {
        Ok(()) => {
            // DirBuilder's mode is filtered by the umask.
            set_mode(dir, mode)?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Sets the permission bits of `path`.
///
/// # Errors
///
/// Returns an IO error if `chmod` fails.
pub fn set_mode(path: &Path, mode: FileMode) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode.bits()))?;
    Ok(())
}

/// Removes the file at `path`. Returns false if nothing was there.
///
/// # Errors
///
/// Returns an IO error if the file exists but cannot be removed.
pub fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Removes the directory tree at `path`. Returns false if nothing was there.
///
/// # Errors
///
/// Returns an IO error if the tree exists but cannot be removed.
pub fn remove_tree(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).expect("metadata").permissions().mode() & 0o7777
    }

    #[test]
    fn ensure_dir_reports_creation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b/c");
        assert!(ensure_dir(&nested, FileMode::new(0o750).expect("mode")).expect("create"));
        assert_eq!(mode_of(&nested), 0o750);
        assert!(!ensure_dir(&nested, FileMode::new(0o750).expect("mode")).expect("exists"));
    }

    #[test]
    fn ensure_dir_keeps_ancestors_traversable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let leaf = dir.path().join("run/users/nobody");
        ensure_dir(&leaf, FileMode::new(0o750).expect("mode")).expect("create");
        assert_eq!(mode_of(&dir.path().join("run")), 0o755);
        assert_eq!(mode_of(&dir.path().join("run/users")), 0o755);
        assert_eq!(mode_of(&leaf), 0o750);
    }

    #[test]
    fn ensure_dir_leaves_existing_ancestors_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let existing = dir.path().join("run");
        fs::create_dir(&existing).expect("mkdir");
        set_mode(&existing, FileMode::new(0o700).expect("mode")).expect("chmod");
        ensure_dir(&existing.join("leaf"), FileMode::new(0o750).expect("mode")).expect("create");
        assert_eq!(mode_of(&existing), 0o700);
    }

    #[test]
    fn ensure_dir_concurrent_callers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("shared/leaf");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let target = target.clone();
                std::thread::spawn(move || ensure_dir(&target, FileMode::new(0o700).expect("mode")))
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().expect("join").expect("ensure"))
            .filter(|created| *created)
            .count();
        assert!(created <= 1);
        assert!(target.is_dir());
    }

    #[test]
    fn remove_file_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("secret");
        fs::write(&file, b"x").expect("write");
        assert!(remove_file(&file).expect("remove"));
        assert!(!remove_file(&file).expect("absent is ok"));
    }

    #[test]
    fn remove_tree_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("env");
        fs::create_dir_all(tree.join("nested")).expect("mkdir");
        fs::write(tree.join("nested/VALUE"), b"x").expect("write");
        assert!(remove_tree(&tree).expect("remove"));
        assert!(!remove_tree(&tree).expect("absent is ok"));
    }

    #[test]
    fn set_mode_applies_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("secret");
        fs::write(&file, b"x").expect("write");
        set_mode(&file, FileMode::new(0o440).expect("mode")).expect("chmod");
        assert_eq!(mode_of(&file), 0o440);
    }

    #[test]
    fn resolves_current_user_numerically() {
        let uid = Uid::current();
        let ownership = Ownership::resolve(&uid.as_raw().to_string(), None).expect("resolve");
        assert_eq!(ownership.uid, uid);
    }

    #[test]
    fn applies_own_ownership() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("secret");
        fs::write(&file, b"x").expect("write");
        let meta = fs::metadata(&file).expect("metadata");
        let ownership = Ownership {
            uid: Uid::from_raw(meta.uid()),
            gid: Gid::from_raw(meta.gid()),
        };
        ownership.apply(&file).expect("chown to self");
    }

    #[test]
    fn unknown_user_is_ownership_error() {
        let err = Ownership::resolve("claw-provision-no-such-user", None).expect_err("unknown");
        assert!(matches!(err, ProvisionError::Ownership(_)));
    }

    #[test]
    fn unknown_group_is_ownership_error() {
        let uid = Uid::current().as_raw().to_string();
        let err = Ownership::resolve(&uid, Some("claw-provision-no-such-group"))
            .expect_err("unknown");
        assert!(matches!(err, ProvisionError::Ownership(_)));
    }
}
