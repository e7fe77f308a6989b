//! Core types for secret provisioning.
//!
//! - [`SecretDescriptor`]: one decryptable artifact and where it lands
//! - [`IdentityRef`]: which identity decrypts it (the only dependency edge)
//! - [`FileMode`]: validated POSIX permission bits
//! - [`ProvisioningState`]: per-descriptor lifecycle
//! - [`Layout`]: the on-disk conventions for sources and targets

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Default owner applied to host secrets.
pub const DEFAULT_OWNER: &str = "root";

/// Suffix carried by every ciphertext artifact.
pub const CIPHERTEXT_SUFFIX: &str = ".age";

/// POSIX permission bits, parsed from an octal string such as `"0400"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileMode(u32);

impl FileMode {
    /// Owner read-only. The default for secrets.
    pub const OWNER_READ: Self = Self(0o400);

    /// Owner read/write.
    pub const OWNER_READ_WRITE: Self = Self(0o600);

    /// Largest accepted value (setuid/setgid/sticky + rwx for all).
    const MAX: u32 = 0o7777;

    /// Creates a mode from raw bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the bits exceed `0o7777`.
    pub fn new(bits: u32) -> Result<Self> {
        if bits > Self::MAX {
            return Err(ProvisionError::Config(format!(
                "mode {bits:o} exceeds 7777"
            )));
        }
        Ok(Self(bits))
    }

    /// Creates a mode from raw bits, discarding anything above `0o7777`.
    #[must_use]
    pub const fn from_bits_masked(bits: u32) -> Self {
        Self(bits & Self::MAX)
    }

    /// Parses an octal string (`"0440"`, `"440"` or `"0o440"`).
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid octal.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(ProvisionError::Config("mode cannot be empty".to_string()));
        }
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|e| ProvisionError::Config(format!("invalid mode '{s}': {e}")))?;
        Self::new(bits)
    }

    /// Returns the raw permission bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl Default for FileMode {
    fn default() -> Self {
        Self::OWNER_READ
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl TryFrom<String> for FileMode {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FileMode> for String {
    fn from(mode: FileMode) -> Self {
        mode.to_string()
    }
}

/// Identity used to decrypt a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityRef {
    /// The host's long-lived master identity.
    Master {
        /// Path to the master identity file.
        path: PathBuf,
    },
    /// An identity placed by another descriptor in an earlier phase.
    Produced {
        /// Name of the producing descriptor.
        by: String,
        /// The producer's target path.
        path: PathBuf,
    },
}

impl IdentityRef {
    /// Reference to the master identity.
    #[must_use]
    pub fn master(path: impl Into<PathBuf>) -> Self {
        Self::Master { path: path.into() }
    }

    /// Reference to an identity produced by descriptor `by`.
    #[must_use]
    pub fn produced(by: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Produced {
            by: by.into(),
            path: path.into(),
        }
    }

    /// Path of the identity file.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Master { path } | Self::Produced { path, .. } => path,
        }
    }

    /// Name of the producing descriptor, if any.
    #[must_use]
    pub fn producer(&self) -> Option<&str> {
        match self {
            Self::Master { .. } => None,
            Self::Produced { by, .. } => Some(by),
        }
    }
}

/// Where a descriptor came from. Ordering matters for merge precedence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Origin {
    /// Caller-supplied `[secrets.*]` entry.
    Explicit,
    /// Synthesized for a configured role.
    Role(String),
    /// Synthesized for a configured user.
    User(String),
    /// Derived from the host manifest.
    Manifest,
    /// Found by scanning the secrets directory.
    Discovered,
}

impl Origin {
    /// Merge precedence; higher wins.
    #[must_use]
    pub const fn precedence(&self) -> u8 {
        match self {
            Self::Explicit => 4,
            Self::Role(_) | Self::User(_) => 3,
            Self::Manifest => 2,
            Self::Discovered => 1,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::Role(role) => write!(f, "role:{role}"),
            Self::User(user) => write!(f, "user:{user}"),
            Self::Manifest => write!(f, "manifest"),
            Self::Discovered => write!(f, "discovered"),
        }
    }
}

/// What running a descriptor's unit does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitAction {
    /// Decrypt `source` to `target`.
    Place,
    /// Decrypt the user's secondary manifest and place every entry it lists.
    ExpandUserManifest {
        /// The user whose secrets are expanded.
        user: String,
        /// Directory holding the user's ciphertexts.
        secrets_dir: PathBuf,
    },
}

/// One decryptable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescriptor {
    /// Unique name within the host's descriptor set.
    pub name: String,
    /// Ciphertext path.
    pub source: PathBuf,
    /// Plaintext destination.
    pub target: PathBuf,
    /// Owning user applied after decrypt.
    pub owner: String,
    /// Owning group; `None` means the owner's primary group.
    pub group: Option<String>,
    /// Permission bits applied after decrypt.
    pub mode: FileMode,
    /// Decryption tier, starting at 1.
    pub phase: u32,
    /// Identity used to decrypt.
    pub identity: IdentityRef,
    /// Source of this descriptor.
    pub origin: Origin,
    /// Unit behaviour.
    pub action: UnitAction,
}

impl SecretDescriptor {
    /// Creates a phase-1 descriptor owned by root with mode `0400`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        identity: IdentityRef,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            owner: DEFAULT_OWNER.to_string(),
            group: None,
            mode: FileMode::default(),
            phase: 1,
            identity,
            origin: Origin::Explicit,
            action: UnitAction::Place,
        }
    }

    /// Sets the owning user.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the owning group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the permission bits.
    #[must_use]
    pub const fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the phase.
    #[must_use]
    pub const fn with_phase(mut self, phase: u32) -> Self {
        self.phase = phase;
        self
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the unit action.
    #[must_use]
    pub fn with_action(mut self, action: UnitAction) -> Self {
        self.action = action;
        self
    }

    /// Returns true if this is a user secondary-manifest expansion unit.
    #[must_use]
    pub const fn is_expansion(&self) -> bool {
        matches!(self.action, UnitAction::ExpandUserManifest { .. })
    }
}

/// Lifecycle of a descriptor within one provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    /// Not started.
    Pending,
    /// Decrypt and placement in progress.
    Decrypting,
    /// Plaintext is in place with final ownership.
    Placed,
    /// Placement failed; no plaintext was left behind.
    Failed,
    /// Target removed by teardown.
    Removed,
}

impl ProvisioningState {
    /// Returns true for `Placed` and `Failed`.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Placed | Self::Failed)
    }

    /// Returns true if moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Decrypting)
                | (Self::Pending, Self::Failed)
                | (Self::Decrypting, Self::Placed)
                | (Self::Decrypting, Self::Failed)
                | (Self::Placed, Self::Removed)
                | (Self::Placed | Self::Failed | Self::Removed, Self::Pending)
        )
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Decrypting => "decrypting",
            Self::Placed => "placed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

/// On-disk conventions for where ciphertexts live and plaintexts go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Master identity file.
    pub master_identity: PathBuf,
    /// Root of the ciphertext repository.
    pub secrets_dir: PathBuf,
    /// Root of the produced plaintext tree.
    pub runtime_root: PathBuf,
}

impl Layout {
    /// Creates a layout.
    #[must_use]
    pub fn new(
        master_identity: impl Into<PathBuf>,
        secrets_dir: impl Into<PathBuf>,
        runtime_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            master_identity: master_identity.into(),
            secrets_dir: secrets_dir.into(),
            runtime_root: runtime_root.into(),
        }
    }

    /// Reference to the master identity.
    #[must_use]
    pub fn master(&self) -> IdentityRef {
        IdentityRef::master(&self.master_identity)
    }

    /// Ciphertext of a role key.
    #[must_use]
    pub fn role_key_source(&self, role: &str) -> PathBuf {
        self.secrets_dir
            .join("roles")
            .join(format!("{role}.key{CIPHERTEXT_SUFFIX}"))
    }

    /// Directory holding a role's ciphertexts.
    #[must_use]
    pub fn role_secrets_dir(&self, role: &str) -> PathBuf {
        self.secrets_dir.join("roles").join(role)
    }

    /// Runtime directory of a role.
    #[must_use]
    pub fn role_dir(&self, role: &str) -> PathBuf {
        self.runtime_root.join("roles").join(role)
    }

    /// Placed role key.
    #[must_use]
    pub fn role_key_target(&self, role: &str) -> PathBuf {
        self.role_dir(role).join("key")
    }

    /// Directory holding a user's ciphertexts.
    #[must_use]
    pub fn user_secrets_dir(&self, user: &str) -> PathBuf {
        self.secrets_dir.join("users").join(user)
    }

    /// Ciphertext of a user's deployment key.
    #[must_use]
    pub fn user_key_source(&self, user: &str) -> PathBuf {
        self.user_secrets_dir(user).join(format!("key{CIPHERTEXT_SUFFIX}"))
    }

    /// Ciphertext of a user's secondary manifest.
    #[must_use]
    pub fn user_manifest_source(&self, user: &str) -> PathBuf {
        self.user_secrets_dir(user)
            .join(format!("secrets.json{CIPHERTEXT_SUFFIX}"))
    }

    /// Runtime directory of a user.
    #[must_use]
    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.runtime_root.join("users").join(user)
    }

    /// Placed user deployment key.
    #[must_use]
    pub fn user_key_target(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("key")
    }

    /// Per-user environment value directory.
    #[must_use]
    pub fn user_env_dir(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("env")
    }

    /// Per-user file secret directory.
    #[must_use]
    pub fn user_files_dir(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("files")
    }
}

/// Validates that `value` is a single, non-traversing path component.
///
/// # Errors
///
/// Returns a configuration error naming `what` if the value is empty,
/// contains a separator, or is `.`/`..`.
pub fn validate_component(what: &str, value: &str) -> Result<()> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !value.contains('/') => Ok(()),
        _ => Err(ProvisionError::Config(format!(
            "{what} '{value}' must be a single path component"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    mod file_mode {
        use super::*;
        use test_case::test_case;

        #[test_case("0400", 0o400)]
        #[test_case("440", 0o440)]
        #[test_case("0o600", 0o600)]
        #[test_case("4750", 0o4750)]
        fn parses_octal(input: &str, bits: u32) {
            assert_eq!(FileMode::parse(input).expect("valid mode").bits(), bits);
        }

        #[test_case(""; "empty")]
        #[test_case("0800"; "non octal digit")]
        #[test_case("17777"; "too large")]
        #[test_case("rw-r--r--"; "symbolic")]
        fn rejects_invalid(input: &str) {
            assert!(FileMode::parse(input).is_err());
        }

        #[test]
        fn displays_four_digits() {
            assert_eq!(FileMode::OWNER_READ.to_string(), "0400");
        }

        #[test]
        fn serde_uses_strings() {
            let json = serde_json::to_string(&FileMode::OWNER_READ_WRITE).expect("serialize");
            assert_eq!(json, "\"0600\"");
            let mode: FileMode = serde_json::from_str("\"0440\"").expect("deserialize");
            assert_eq!(mode.bits(), 0o440);
        }
    }

    mod provisioning_state {
        use super::*;

        #[test]
        fn resolved_states() {
            assert!(!ProvisioningState::Pending.is_resolved());
            assert!(!ProvisioningState::Decrypting.is_resolved());
            assert!(ProvisioningState::Placed.is_resolved());
            assert!(ProvisioningState::Failed.is_resolved());
            assert!(!ProvisioningState::Removed.is_resolved());
        }

        #[test]
        fn legal_transitions() {
            use ProvisioningState::*;
            assert!(Pending.can_transition_to(Decrypting));
            assert!(Pending.can_transition_to(Failed));
            assert!(Decrypting.can_transition_to(Placed));
            assert!(Decrypting.can_transition_to(Failed));
            assert!(Placed.can_transition_to(Removed));
            assert!(Removed.can_transition_to(Pending));
            assert!(!Pending.can_transition_to(Placed));
            assert!(!Failed.can_transition_to(Removed));
            assert!(!Removed.can_transition_to(Placed));
        }
    }

    mod layout {
        use super::*;

        fn layout() -> Layout {
            Layout::new("/etc/master.key", "/srv/secrets", "/run/claw-secrets")
        }

        #[test]
        fn role_paths() {
            let l = layout();
            assert_eq!(l.role_key_source("web"), PathBuf::from("/srv/secrets/roles/web.key.age"));
            assert_eq!(l.role_key_target("web"), PathBuf::from("/run/claw-secrets/roles/web/key"));
            assert_eq!(l.role_secrets_dir("web"), PathBuf::from("/srv/secrets/roles/web"));
        }

        #[test]
        fn user_paths() {
            let l = layout();
            assert_eq!(l.user_key_source("alice"), PathBuf::from("/srv/secrets/users/alice/key.age"));
            assert_eq!(
                l.user_manifest_source("alice"),
                PathBuf::from("/srv/secrets/users/alice/secrets.json.age")
            );
            assert_eq!(l.user_env_dir("alice"), PathBuf::from("/run/claw-secrets/users/alice/env"));
            assert_eq!(l.user_files_dir("alice"), PathBuf::from("/run/claw-secrets/users/alice/files"));
        }
    }

    #[test_case("web"; "plain")]
    #[test_case("API_TOKEN"; "upper")]
    #[test_case(".hidden"; "dotfile")]
    fn component_accepts(value: &str) {
        assert!(validate_component("name", value).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case(".."; "parent")]
    #[test_case("."; "current")]
    #[test_case("a/b"; "separator")]
    #[test_case("/abs"; "absolute")]
    fn component_rejects(value: &str) {
        assert!(validate_component("name", value).is_err());
    }

    #[test]
    fn origin_precedence_order() {
        assert!(Origin::Explicit.precedence() > Origin::Role("r".into()).precedence());
        assert!(Origin::User("u".into()).precedence() > Origin::Manifest.precedence());
        assert!(Origin::Manifest.precedence() > Origin::Discovered.precedence());
    }

    #[test]
    fn identity_ref_accessors() {
        let master = IdentityRef::master("/etc/master.key");
        assert_eq!(master.path(), Path::new("/etc/master.key"));
        assert_eq!(master.producer(), None);

        let produced = IdentityRef::produced("role-key-web", "/run/claw-secrets/roles/web/key");
        assert_eq!(produced.producer(), Some("role-key-web"));
    }
}
