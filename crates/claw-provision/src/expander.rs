//! Per-user secondary-manifest expansion.
//!
//! A user's secrets are listed in an encrypted JSON index decrypted with the
//! user's deployment key:
//!
//! ```json
//! {"secrets": {"3f9a1c.age": {"name": "API_TOKEN", "type": "env"},
//!              "b71e04.age": {"name": "id_rsa", "type": "file", "target": "/home/alice/.ssh/id_rsa"}}}
//! ```
//!
//! Keys are ciphertext file names inside the user's secrets directory.
//! Each entry is placed independently with the same identity.
//!
//! Targets outside the user's directory are listed in a root-owned record
//! next to it (`.<user>.overrides`), so a later run or a teardown can remove
//! them without the index.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decrypt::Decryptor;
use crate::error::{ProvisionError, Result};
use crate::executor::{self, ExecMode};
use crate::fsops;
use crate::report::{EntryOutcome, EntryStatus, ProvisionWarning};
use crate::types::{validate_component, FileMode, Origin, SecretDescriptor, UnitAction};

/// How a secondary-manifest entry is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Value placed under the user's `env/` directory.
    Env,
    /// File placed under `files/` or at an explicit target.
    File,
}

/// One secondary-manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryEntry {
    /// Logical name; becomes the file name.
    pub name: String,
    /// Exposure kind.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Explicit destination, honoured for `file` entries only.
    #[serde(default)]
    pub target: Option<PathBuf>,
}

impl SecondaryEntry {
    /// Returns true if the entry is placed outside the user's directory.
    #[must_use]
    pub fn overrides_target(&self) -> bool {
        self.kind == EntryKind::File && self.target.is_some()
    }
}

/// Decrypted per-user index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSecondaryManifest {
    /// Entries keyed by ciphertext file name.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecondaryEntry>,
}

impl UserSecondaryManifest {
    /// Parses the JSON index.
    ///
    /// # Errors
    ///
    /// Returns the parser diagnostic.
    pub fn from_json(content: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }
}

/// Outcome of expanding one user's secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    /// Per-entry outcomes, ordered by ciphertext file name.
    pub entries: Vec<EntryOutcome>,
    /// Non-fatal conditions.
    pub warnings: Vec<ProvisionWarning>,
}

impl Expansion {
    /// Number of entries placed.
    #[must_use]
    pub fn placed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Placed)
            .count()
    }
}

/// Runtime directory for `env` entries.
#[must_use]
pub fn env_dir(user_dir: &Path) -> PathBuf {
    user_dir.join("env")
}

/// Runtime directory for `file` entries without an explicit target.
#[must_use]
pub fn files_dir(user_dir: &Path) -> PathBuf {
    user_dir.join("files")
}

/// Expands the user's secondary manifest described by `descriptor`.
///
/// `descriptor.source` is the encrypted index, `descriptor.target` the
/// user's runtime directory and `descriptor.identity` the user's key. A
/// missing index is a warning and yields an empty expansion.
///
/// # Errors
///
/// Fails the whole unit if the descriptor is not an expansion unit, the
/// user key is absent, or the index cannot be decrypted or parsed. Entry
/// failures are reported in the returned [`Expansion`].
pub fn expand_user_secrets(
    descriptor: &SecretDescriptor,
    mode: &ExecMode,
    decryptor: &dyn Decryptor,
) -> Result<Expansion> {
    let UnitAction::ExpandUserManifest { user, secrets_dir } = &descriptor.action else {
        return Err(ProvisionError::Internal(format!(
            "'{}' is not an expansion unit",
            descriptor.name
        )));
    };

    let identity = mode.identity_path(&descriptor.identity);
    if let Some(producer) = descriptor.identity.producer() {
        if !identity.is_file() {
            return Err(ProvisionError::blocked_by(producer));
        }
    }

    if !descriptor.source.is_file() {
        warn!(user = %user, path = %descriptor.source.display(), "no secondary manifest");
        return Ok(Expansion {
            entries: Vec::new(),
            warnings: vec![ProvisionWarning::SecondaryManifestMissing {
                user: user.clone(),
                path: descriptor.source.clone(),
            }],
        });
    }

    let manifest = decrypt_index(descriptor, user, &identity, mode, decryptor)?;

    let user_dir = mode.effective(&descriptor.target);
    let previous_overrides = read_overrides(&user_dir)?;
    let mut overrides = Vec::new();

    let mut expansion = Expansion::default();
    for (file_name, entry) in &manifest.secrets {
        let source = secrets_dir.join(file_name);
        let outcome = match entry_descriptor(descriptor, user, &source, file_name, entry) {
            Err(e) => EntryOutcome::failed(&entry.name, source, &e),
            Ok(entry_descriptor) if !source.is_file() => {
                let stale = mode.effective(&entry_descriptor.target);
                match fsops::remove_file(&stale) {
                    Err(e) => EntryOutcome::failed(&entry.name, source, &e),
                    Ok(removed) => {
                        if removed {
                            debug!(user = %user, target = %stale.display(), "removed stale target");
                        }
                        warn!(
                            user = %user,
                            entry = %entry.name,
                            path = %source.display(),
                            "secret missing"
                        );
                        expansion.warnings.push(ProvisionWarning::EntryMissing {
                            user: user.clone(),
                            entry: entry.name.clone(),
                            path: source.clone(),
                        });
                        EntryOutcome::missing(&entry.name, source)
                    }
                }
            }
            Ok(entry_descriptor) => match executor::place(&entry_descriptor, mode, decryptor) {
                Ok(target) => {
                    if entry.overrides_target() {
                        overrides.push(target.clone());
                    }
                    EntryOutcome::placed(&entry.name, source, target)
                }
                Err(e) => {
                    warn!(
                        user = %user,
                        entry = %entry.name,
                        error = %e,
                        "failed to place user secret"
                    );
                    EntryOutcome::failed(&entry.name, source, &e)
                }
            },
        };
        expansion.entries.push(outcome);
    }

    for stale in previous_overrides.iter().filter(|p| !overrides.contains(p)) {
        if fsops::remove_file(stale)? {
            info!(user = %user, target = %stale.display(), "removed dropped override target");
        }
    }
    write_overrides(&user_dir, &overrides)?;

    info!(
        user = %user,
        entries = expansion.entries.len(),
        placed = expansion.placed(),
        "expanded user secrets"
    );
    Ok(expansion)
}

/// Decrypts the index into a transient file inside the user's directory.
/// The file is deleted when the guard drops, on every path.
fn decrypt_index(
    descriptor: &SecretDescriptor,
    user: &str,
    identity: &Path,
    mode: &ExecMode,
    decryptor: &dyn Decryptor,
) -> Result<UserSecondaryManifest> {
    let user_dir = mode.effective(&descriptor.target);
    let ownership = executor::resolve_ownership(descriptor, mode)?;
    executor::stage_dir(descriptor, &user_dir, mode, ownership.as_ref())?;

    let transient = tempfile::Builder::new()
        .prefix(".secrets-manifest")
        .tempfile_in(&user_dir)?;
    decryptor.decrypt(identity, &descriptor.source, transient.path())?;

    let content = zeroize::Zeroizing::new(std::fs::read_to_string(transient.path())?);
    UserSecondaryManifest::from_json(&content).map_err(|reason| {
        ProvisionError::SecondaryManifest {
            user: user.to_string(),
            reason,
        }
    })
}

fn entry_descriptor(
    parent: &SecretDescriptor,
    user: &str,
    source: &Path,
    file_name: &str,
    entry: &SecondaryEntry,
) -> Result<SecretDescriptor> {
    validate_component("secondary manifest key", file_name)?;
    validate_component("secret name", &entry.name)?;

    let target = match (entry.kind, &entry.target) {
        (EntryKind::File, Some(target)) if !target.is_absolute() => {
            return Err(ProvisionError::Config(format!(
                "target '{}' of user secret '{}' is not absolute",
                target.display(),
                entry.name
            )));
        }
        (EntryKind::File, Some(target)) => target.clone(),
        (EntryKind::File, None) => files_dir(&parent.target).join(&entry.name),
        (EntryKind::Env, _) => env_dir(&parent.target).join(&entry.name),
    };

    let mut descriptor = SecretDescriptor::new(
        format!("{}/{}", parent.name, entry.name),
        source,
        target,
        parent.identity.clone(),
    )
    .with_owner(&parent.owner)
    .with_mode(FileMode::OWNER_READ)
    .with_phase(parent.phase)
    .with_origin(Origin::User(user.to_string()));
    descriptor.group.clone_from(&parent.group);
    Ok(descriptor)
}

/// Removes everything placed for one user: `env/`, `files/` and every
/// recorded override target. `user_dir` is the effective user directory.
///
/// # Errors
///
/// Returns an IO error if something exists but cannot be removed, or if
/// the override record is unreadable.
pub fn remove_user_secrets(user: &str, user_dir: &Path) -> Result<()> {
    for dir in [env_dir(user_dir), files_dir(user_dir)] {
        if fsops::remove_tree(&dir)? {
            info!(user = %user, dir = %dir.display(), "removed user secrets");
        }
    }
    for target in read_overrides(user_dir)? {
        if fsops::remove_file(&target)? {
            info!(user = %user, target = %target.display(), "removed override target");
        }
    }
    write_overrides(user_dir, &[])
}

/// Location of the override record for `user_dir`.
fn overrides_record(user_dir: &Path) -> Result<PathBuf> {
    let (Some(parent), Some(name)) = (user_dir.parent(), user_dir.file_name()) else {
        return Err(ProvisionError::Internal(format!(
            "user directory '{}' has no parent",
            user_dir.display()
        )));
    };
    let mut file = OsString::from(".");
    file.push(name);
    file.push(".overrides");
    Ok(parent.join(file))
}

fn read_overrides(user_dir: &Path) -> Result<Vec<PathBuf>> {
    let record = overrides_record(user_dir)?;
    let content = match std::fs::read_to_string(&record) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content).map_err(|e| {
        ProvisionError::Internal(format!("corrupt override record '{}': {e}", record.display()))
    })
}

/// Replaces the record with `targets`; an empty list removes it.
fn write_overrides(user_dir: &Path, targets: &[PathBuf]) -> Result<()> {
    let record = overrides_record(user_dir)?;
    if targets.is_empty() {
        fsops::remove_file(&record)?;
        return Ok(());
    }
    let parent = record.parent().unwrap_or(user_dir);
    let body = serde_json::to_vec(targets)
        .map_err(|e| ProvisionError::Internal(format!("encode override record: {e}")))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".claw-provision")
        .tempfile_in(parent)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&record).map_err(|e| ProvisionError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypt::{seal, Identity, SealedBoxDecryptor};
    use crate::types::{IdentityRef, Layout};

    struct UserFixture {
        dir: tempfile::TempDir,
        key: Identity,
        layout: Layout,
    }

    impl UserFixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let layout = Layout::new(
                dir.path().join("master.key"),
                dir.path().join("secrets"),
                "/run/claw-secrets",
            );
            let key = Identity::generate();
            let sandbox = ExecMode::dry_run(dir.path().join("sandbox"));
            let key_path = sandbox.effective(&layout.user_key_target("alice"));
            std::fs::create_dir_all(key_path.parent().expect("parent")).expect("mkdir");
            std::fs::write(&key_path, key.to_file_contents().as_bytes()).expect("write key");
            std::fs::create_dir_all(layout.user_secrets_dir("alice")).expect("mkdir");
            Self { dir, key, layout }
        }

        fn mode(&self) -> ExecMode {
            ExecMode::dry_run(self.dir.path().join("sandbox"))
        }

        fn seal_to(&self, path: &Path, plaintext: &[u8]) {
            std::fs::write(path, seal(&self.key.recipient(), plaintext).expect("seal"))
                .expect("write");
        }

        fn write_index(&self, json: &str) {
            self.seal_to(&self.layout.user_manifest_source("alice"), json.as_bytes());
        }

        fn descriptor(&self) -> SecretDescriptor {
            SecretDescriptor::new(
                "user-secrets-alice",
                self.layout.user_manifest_source("alice"),
                self.layout.user_dir("alice"),
                IdentityRef::produced("user-key-alice", self.layout.user_key_target("alice")),
            )
            .with_owner("alice")
            .with_phase(2)
            .with_origin(Origin::User("alice".into()))
            .with_action(UnitAction::ExpandUserManifest {
                user: "alice".into(),
                secrets_dir: self.layout.user_secrets_dir("alice"),
            })
        }

        fn user_dir(&self) -> PathBuf {
            self.mode().effective(&self.layout.user_dir("alice"))
        }
    }

    #[test]
    fn parses_index() {
        let manifest = UserSecondaryManifest::from_json(
            r#"{"secrets": {"a.age": {"name": "TOKEN", "type": "env"},
                            "b.age": {"name": "cert", "type": "file", "target": "/etc/cert"}}}"#,
        )
        .expect("parse");
        assert_eq!(manifest.secrets["a.age"].kind, EntryKind::Env);
        assert_eq!(
            manifest.secrets["b.age"].target,
            Some(PathBuf::from("/etc/cert"))
        );
        assert!(UserSecondaryManifest::from_json(r#"{"secrets": {"a.age": {"name": "x", "type": "pipe"}}}"#).is_err());
    }

    #[test]
    fn absent_index_is_warning() {
        let fx = UserFixture::new();
        let expansion =
            expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
                .expect("absent index is not fatal");
        assert!(expansion.entries.is_empty());
        assert!(matches!(
            expansion.warnings.as_slice(),
            [ProvisionWarning::SecondaryManifestMissing { .. }]
        ));
    }

    #[test]
    fn one_missing_one_present() {
        let fx = UserFixture::new();
        fx.write_index(
            r#"{"secrets": {"aaa.age": {"name": "API_TOKEN", "type": "env"},
                            "bbb.age": {"name": "DB_URL", "type": "env"}}}"#,
        );
        fx.seal_to(&fx.layout.user_secrets_dir("alice").join("aaa.age"), b"tok");

        let expansion =
            expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
                .expect("expand");
        assert_eq!(expansion.placed(), 1);
        assert_eq!(expansion.warnings.len(), 1);
        assert_eq!(expansion.entries[1].status, EntryStatus::Missing);

        let placed = fx.user_dir().join("env/API_TOKEN");
        assert_eq!(std::fs::read(placed).expect("read"), b"tok");
    }

    #[test]
    fn file_entries_honour_target() {
        let fx = UserFixture::new();
        fx.write_index(
            r#"{"secrets": {"c.age": {"name": "id_ed25519", "type": "file", "target": "/home/alice/.ssh/id_ed25519"},
                            "d.age": {"name": "netrc", "type": "file"},
                            "e.age": {"name": "IGNORED_TARGET", "type": "env", "target": "/etc/passwd"}}}"#,
        );
        let dir = fx.layout.user_secrets_dir("alice");
        fx.seal_to(&dir.join("c.age"), b"ssh");
        fx.seal_to(&dir.join("d.age"), b"netrc");
        fx.seal_to(&dir.join("e.age"), b"env");

        let mode = fx.mode();
        let expansion = expand_user_secrets(&fx.descriptor(), &mode, &SealedBoxDecryptor::new())
            .expect("expand");
        assert_eq!(expansion.placed(), 3);
        assert!(mode.effective(Path::new("/home/alice/.ssh/id_ed25519")).is_file());
        assert!(fx.user_dir().join("files/netrc").is_file());
        assert!(fx.user_dir().join("env/IGNORED_TARGET").is_file());
    }

    #[test]
    fn missing_entry_removes_previous_plaintext() {
        let fx = UserFixture::new();
        fx.write_index(r#"{"secrets": {"aaa.age": {"name": "API_TOKEN", "type": "env"}}}"#);
        let source = fx.layout.user_secrets_dir("alice").join("aaa.age");
        fx.seal_to(&source, b"old-token");

        let decryptor = SealedBoxDecryptor::new();
        expand_user_secrets(&fx.descriptor(), &fx.mode(), &decryptor).expect("first");
        let placed = fx.user_dir().join("env/API_TOKEN");
        assert!(placed.is_file());

        std::fs::remove_file(&source).expect("remove source");
        let expansion =
            expand_user_secrets(&fx.descriptor(), &fx.mode(), &decryptor).expect("second");
        assert_eq!(expansion.entries[0].status, EntryStatus::Missing);
        assert_eq!(expansion.warnings.len(), 1);
        assert!(!placed.exists());
    }

    #[test]
    fn relative_override_fails_the_entry() {
        let fx = UserFixture::new();
        fx.write_index(
            r#"{"secrets": {"h.age": {"name": "key", "type": "file", "target": "ssh/id_ed25519"}}}"#,
        );
        fx.seal_to(&fx.layout.user_secrets_dir("alice").join("h.age"), b"k");

        let expansion =
            expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
                .expect("expand");
        assert_eq!(expansion.entries[0].status, EntryStatus::Failed);
        assert!(expansion.entries[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("not absolute")));
        assert!(!Path::new("ssh/id_ed25519").exists());
    }

    #[test]
    fn override_targets_follow_the_index() {
        let fx = UserFixture::new();
        let dir = fx.layout.user_secrets_dir("alice");
        fx.write_index(
            r#"{"secrets": {"c.age": {"name": "id_ed25519", "type": "file", "target": "/home/alice/.ssh/id_ed25519"},
                            "d.age": {"name": "TOKEN", "type": "env"}}}"#,
        );
        fx.seal_to(&dir.join("c.age"), b"ssh");
        fx.seal_to(&dir.join("d.age"), b"tok");

        let mode = fx.mode();
        let decryptor = SealedBoxDecryptor::new();
        let override_target = mode.effective(Path::new("/home/alice/.ssh/id_ed25519"));
        expand_user_secrets(&fx.descriptor(), &mode, &decryptor).expect("first");
        assert!(override_target.is_file());

        fx.write_index(r#"{"secrets": {"d.age": {"name": "TOKEN", "type": "env"}}}"#);
        expand_user_secrets(&fx.descriptor(), &mode, &decryptor).expect("second");
        assert!(!override_target.exists());
        assert!(fx.user_dir().join("env/TOKEN").is_file());
    }

    #[test]
    fn remove_user_secrets_clears_overrides() {
        let fx = UserFixture::new();
        fx.write_index(
            r#"{"secrets": {"c.age": {"name": "id_ed25519", "type": "file", "target": "/home/alice/.ssh/id_ed25519"}}}"#,
        );
        fx.seal_to(&fx.layout.user_secrets_dir("alice").join("c.age"), b"ssh");

        let mode = fx.mode();
        expand_user_secrets(&fx.descriptor(), &mode, &SealedBoxDecryptor::new())
            .expect("expand");
        let record = overrides_record(&fx.user_dir()).expect("record path");
        assert!(record.is_file());

        remove_user_secrets("alice", &fx.user_dir()).expect("remove");
        assert!(!mode.effective(Path::new("/home/alice/.ssh/id_ed25519")).exists());
        assert!(!record.exists());
        remove_user_secrets("alice", &fx.user_dir()).expect("idempotent");
    }

    #[test]
    fn unsafe_names_fail_the_entry_only() {
        let fx = UserFixture::new();
        fx.write_index(
            r#"{"secrets": {"f.age": {"name": "../escape", "type": "env"},
                            "g.age": {"name": "OK", "type": "env"}}}"#,
        );
        let dir = fx.layout.user_secrets_dir("alice");
        fx.seal_to(&dir.join("f.age"), b"x");
        fx.seal_to(&dir.join("g.age"), b"y");

        let expansion =
            expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
                .expect("expand");
        assert_eq!(expansion.entries[0].status, EntryStatus::Failed);
        assert_eq!(expansion.entries[1].status, EntryStatus::Placed);
    }

    #[test]
    fn transient_index_is_removed() {
        let fx = UserFixture::new();
        fx.write_index(r#"{"secrets": {}}"#);
        expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
            .expect("expand");

        fx.write_index("not json");
        let err = expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
            .expect_err("bad index");
        assert!(matches!(err, ProvisionError::SecondaryManifest { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(fx.user_dir())
            .expect("read dir")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".secrets-manifest"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_user_key_blocks() {
        let fx = UserFixture::new();
        std::fs::remove_file(fx.mode().effective(&fx.layout.user_key_target("alice")))
            .expect("remove key");
        let err = expand_user_secrets(&fx.descriptor(), &fx.mode(), &SealedBoxDecryptor::new())
            .expect_err("blocked");
        assert!(matches!(err, ProvisionError::DependencyBlocked { .. }));
    }
}
