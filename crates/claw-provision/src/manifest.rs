//! Host secret manifest.
//!
//! The manifest is an optional declarative file listing the host's secrets.
//! A missing file is normal and yields an empty manifest; a file that exists
//! but does not parse is a configuration error. Unknown keys are ignored so
//! older hosts keep working with newer manifests.
//!
//! ```toml
//! [ssh-host-keys]
//!
//! [keytab]
//! mode = "0640"
//! group = "krb"
//!
//! [secrets.grafana-admin]
//! user = "grafana"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::types::{FileMode, Layout, Origin, SecretDescriptor, CIPHERTEXT_SUFFIX, DEFAULT_OWNER};

/// One manifest section or `secrets` entry. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestEntry {
    /// Ciphertext path.
    pub source: Option<PathBuf>,
    /// Plaintext destination.
    pub target: Option<PathBuf>,
    /// Owning user.
    pub user: Option<String>,
    /// Owning group.
    pub group: Option<String>,
    /// Permission bits.
    pub mode: Option<FileMode>,
}

/// Parsed host manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    /// Host SSH private key.
    #[serde(rename = "ssh-host-keys")]
    pub ssh_host_keys: Option<ManifestEntry>,
    /// Kerberos keytab.
    pub keytab: Option<ManifestEntry>,
    /// Artifact repository credential.
    #[serde(rename = "nexus-key")]
    pub nexus_key: Option<ManifestEntry>,
    /// Arbitrary named secrets.
    pub secrets: BTreeMap<String, ManifestEntry>,
}

/// Documented fallbacks for a well-known section.
struct SectionDefaults {
    name: &'static str,
    source_file: &'static str,
    target: fn(&Layout) -> PathBuf,
    mode: FileMode,
}

const SSH_HOST_KEYS: SectionDefaults = SectionDefaults {
    name: "ssh-host-keys",
    source_file: "ssh-host-ed25519-key",
    target: |_| PathBuf::from("/etc/ssh/ssh_host_ed25519_key"),
    mode: FileMode::OWNER_READ_WRITE,
};

const KEYTAB: SectionDefaults = SectionDefaults {
    name: "keytab",
    source_file: "krb5.keytab",
    target: |_| PathBuf::from("/etc/krb5.keytab"),
    mode: FileMode::OWNER_READ_WRITE,
};

const NEXUS_KEY: SectionDefaults = SectionDefaults {
    name: "nexus-key",
    source_file: "nexus-key",
    target: |layout| layout.runtime_root.join("nexus-key"),
    mode: FileMode::OWNER_READ,
};

impl Manifest {
    /// An explicitly empty manifest.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if the manifest declares nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ssh_host_keys.is_none()
            && self.keytab.is_none()
            && self.nexus_key.is_none()
            && self.secrets.is_empty()
    }

    /// Parses a TOML manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> std::result::Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Parses a JSON manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(content: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    /// Enables the `ssh-host-keys` section with defaults if it is absent.
    pub fn enable_ssh_host_keys(&mut self) {
        self.ssh_host_keys.get_or_insert_with(ManifestEntry::default);
    }

    /// Enables the `keytab` section with defaults if it is absent.
    pub fn enable_keytab(&mut self) {
        self.keytab.get_or_insert_with(ManifestEntry::default);
    }

    /// Expands the manifest into phase-1 descriptors with defaults applied.
    ///
    /// Output order is deterministic: well-known sections first, then
    /// `secrets` entries by name.
    #[must_use]
    pub fn descriptors(&self, layout: &Layout) -> Vec<SecretDescriptor> {
        let sections = [
            (&SSH_HOST_KEYS, self.ssh_host_keys.as_ref()),
            (&KEYTAB, self.keytab.as_ref()),
            (&NEXUS_KEY, self.nexus_key.as_ref()),
        ];

        let mut out: Vec<SecretDescriptor> = sections
            .into_iter()
            .filter_map(|(defaults, entry)| {
                entry.map(|e| {
                    e.to_descriptor(
                        defaults.name,
                        layout
                            .secrets_dir
                            .join(format!("{}{CIPHERTEXT_SUFFIX}", defaults.source_file)),
                        (defaults.target)(layout),
                        defaults.mode,
                        layout,
                    )
                })
            })
            .collect();

        out.extend(self.secrets.iter().map(|(name, entry)| {
            entry.to_descriptor(
                name,
                layout.secrets_dir.join(format!("{name}{CIPHERTEXT_SUFFIX}")),
                layout.runtime_root.join(name),
                FileMode::OWNER_READ,
                layout,
            )
        }));

        out
    }
}

impl ManifestEntry {
    fn to_descriptor(
        &self,
        name: &str,
        default_source: PathBuf,
        default_target: PathBuf,
        default_mode: FileMode,
        layout: &Layout,
    ) -> SecretDescriptor {
        let group = match (&self.user, &self.group) {
            (_, Some(group)) => Some(group.clone()),
            (None, None) => Some(DEFAULT_OWNER.to_string()),
            (Some(_), None) => None,
        };
        let mut descriptor = SecretDescriptor::new(
            name,
            self.source.clone().unwrap_or(default_source),
            self.target.clone().unwrap_or(default_target),
            layout.master(),
        )
        .with_owner(self.user.as_deref().unwrap_or(DEFAULT_OWNER))
        .with_mode(self.mode.unwrap_or(default_mode))
        .with_origin(Origin::Manifest);
        descriptor.group = group;
        descriptor
    }
}

/// Loads a manifest from `path`.
///
/// A missing file returns [`Manifest::empty`]. Files ending in `.json` are
/// parsed as JSON, everything else as TOML.
///
/// # Errors
///
/// Returns [`ProvisionError::ManifestParse`] if the file exists but cannot be
/// parsed, or an IO error if it cannot be read.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no manifest present, using empty manifest");
            return Ok(Manifest::empty());
        }
        Err(e) => return Err(e.into()),
    };

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let parsed = if is_json {
        Manifest::from_json(&content)
    } else {
        Manifest::from_toml(&content)
    };

    let manifest = parsed.map_err(|reason| ProvisionError::ManifestParse {
        path: path.to_path_buf(),
        reason,
    })?;
    info!(
        path = %path.display(),
        secrets = manifest.secrets.len(),
        "loaded manifest"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn layout() -> Layout {
        Layout::new("/etc/master.key", "/srv/secrets", "/run/claw-secrets")
    }

    #[test]
    fn missing_file_is_empty_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = load_manifest(&dir.path().join("manifest.toml")).expect("absent is ok");
        assert!(manifest.is_empty());
        assert!(manifest.descriptors(&layout()).is_empty());
    }

    #[test]
    fn invalid_file_is_parse_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("temp file");
        file.write_all(b"[keytab\nmode = ").expect("write");
        let err = load_manifest(file.path()).expect_err("should fail");
        assert!(matches!(err, ProvisionError::ManifestParse { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn bad_mode_is_parse_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("temp file");
        file.write_all(b"[keytab]\nmode = \"0999\"\n").expect("write");
        assert!(load_manifest(file.path()).is_err());
    }

    #[test]
    fn empty_sections_use_defaults() {
        let manifest = Manifest::from_toml("[ssh-host-keys]\n[keytab]\n").expect("parse");
        let descriptors = manifest.descriptors(&layout());
        assert_eq!(descriptors.len(), 2);

        let ssh = &descriptors[0];
        assert_eq!(ssh.name, "ssh-host-keys");
        assert_eq!(ssh.source, PathBuf::from("/srv/secrets/ssh-host-ed25519-key.age"));
        assert_eq!(ssh.target, PathBuf::from("/etc/ssh/ssh_host_ed25519_key"));
        assert_eq!(ssh.owner, "root");
        assert_eq!(ssh.group.as_deref(), Some("root"));
        assert_eq!(ssh.mode, FileMode::OWNER_READ_WRITE);
        assert_eq!(ssh.phase, 1);
        assert_eq!(ssh.origin, Origin::Manifest);

        assert_eq!(descriptors[1].target, PathBuf::from("/etc/krb5.keytab"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let toml = r#"
            future-feature = true

            [nexus-key]
            colour = "blue"

            [secrets.grafana]
            user = "grafana"
            mode = "0440"
        "#;
        let manifest = Manifest::from_toml(toml).expect("forward compatible");
        let descriptors = manifest.descriptors(&layout());
        assert_eq!(descriptors.len(), 2);

        let nexus = &descriptors[0];
        assert_eq!(nexus.target, PathBuf::from("/run/claw-secrets/nexus-key"));
        assert_eq!(nexus.mode, FileMode::OWNER_READ);

        let grafana = &descriptors[1];
        assert_eq!(grafana.name, "grafana");
        assert_eq!(grafana.source, PathBuf::from("/srv/secrets/grafana.age"));
        assert_eq!(grafana.target, PathBuf::from("/run/claw-secrets/grafana"));
        assert_eq!(grafana.owner, "grafana");
        // A non-root user without an explicit group gets their primary group.
        assert_eq!(grafana.group, None);
        assert_eq!(grafana.mode.bits(), 0o440);
    }

    #[test]
    fn json_manifest_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().expect("temp file");
        file.write_all(br#"{"secrets": {"token": {"target": "/etc/token"}}}"#)
            .expect("write");
        let manifest = load_manifest(file.path()).expect("parse json");
        let descriptors = manifest.descriptors(&layout());
        assert_eq!(descriptors[0].target, PathBuf::from("/etc/token"));
    }

    #[test]
    fn toggles_enable_sections() {
        let mut manifest = Manifest::empty();
        manifest.enable_keytab();
        manifest.enable_ssh_host_keys();
        assert_eq!(manifest.descriptors(&layout()).len(), 2);

        let mut custom = Manifest::from_toml("[keytab]\nmode = \"0640\"\n").expect("parse");
        custom.enable_keytab();
        assert_eq!(custom.descriptors(&layout())[0].mode.bits(), 0o640);
    }
}
