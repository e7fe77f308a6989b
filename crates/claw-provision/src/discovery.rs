//! Ciphertext auto-discovery.
//!
//! The only filesystem read the registry depends on. It runs once per
//! provisioning run, before descriptors are built.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::types::{Layout, CIPHERTEXT_SUFFIX};

/// A ciphertext found on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DiscoveredFile {
    /// Logical name (file name without the ciphertext suffix).
    pub name: String,
    /// Full path of the ciphertext.
    pub path: PathBuf,
}

/// Result of scanning the secrets repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Discovered {
    /// Top-level host ciphertexts.
    pub host: Vec<DiscoveredFile>,
    /// Per-role ciphertexts keyed by role name.
    pub roles: BTreeMap<String, Vec<DiscoveredFile>>,
}

impl Discovered {
    /// Nothing discovered.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Scans `dir` (non-recursively) for ciphertext files, sorted by name.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns an IO error if the directory exists but cannot be read.
pub fn scan_dir(dir: &Path) -> Result<Vec<DiscoveredFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(CIPHERTEXT_SUFFIX) else {
            continue;
        };
        if stem.is_empty() || stem.starts_with('.') {
            continue;
        }
        found.push(DiscoveredFile {
            name: stem.to_string(),
            path: entry.path(),
        });
    }
    found.sort();
    Ok(found)
}

/// Scans the host secrets directory and each role's directory.
///
/// # Errors
///
/// Returns an IO error if a directory exists but cannot be read.
pub fn discover(layout: &Layout, roles: &[String]) -> Result<Discovered> {
    let host = scan_dir(&layout.secrets_dir)?;
    let mut by_role = BTreeMap::new();
    for role in roles {
        by_role.insert(role.clone(), scan_dir(&layout.role_secrets_dir(role))?);
    }
    debug!(
        host = host.len(),
        roles = by_role.len(),
        "discovered ciphertexts"
    );
    Ok(Discovered {
        host,
        roles: by_role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, b"ciphertext").expect("write");
    }

    #[test]
    fn finds_only_suffixed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("db-password.age"));
        touch(&dir.path().join("api.age"));
        touch(&dir.path().join("manifest.toml"));
        touch(&dir.path().join(".age"));
        touch(&dir.path().join("users/alice/key.age"));

        let found = scan_dir(dir.path()).expect("scan");
        let names: Vec<_> = found.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["api", "db-password"]);
        assert_eq!(found[1].path, dir.path().join("db-password.age"));
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(scan_dir(&dir.path().join("nope")).expect("scan").is_empty());
    }

    #[test]
    fn discovers_role_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new("/etc/master.key", dir.path(), "/run/claw-secrets");
        touch(&dir.path().join("roles/web/tls.age"));
        touch(&dir.path().join("roles/web.key.age"));
        touch(&dir.path().join("host.age"));

        let discovered =
            discover(&layout, &["web".to_string(), "db".to_string()]).expect("discover");
        assert_eq!(discovered.host.len(), 1);
        assert_eq!(discovered.roles["web"].len(), 1);
        assert_eq!(discovered.roles["web"][0].name, "tls");
        assert!(discovered.roles["db"].is_empty());
    }
}
