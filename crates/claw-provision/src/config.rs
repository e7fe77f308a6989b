//! Provisioning configuration.
//!
//! The input surface collected by the host's declarative layer and handed to
//! the orchestrator as a TOML file:
//! - Repository layout (master identity, secrets directory, runtime root)
//! - Explicit `[secrets.*]` entries
//! - Convenience toggles, role and user lists
//! - Dry-run and manifest switches
//! - Decrypt primitive selection

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decrypt::{CommandDecryptor, Decryptor, SealedBoxDecryptor};
use crate::error::{ProvisionError, Result};
use crate::executor::ExecMode;
use crate::types::{validate_component, FileMode, Layout, DEFAULT_OWNER};

/// Default root of the produced plaintext tree.
pub const DEFAULT_RUNTIME_ROOT: &str = "/run/claw-secrets";

/// Default sandbox root for dry runs.
pub const DEFAULT_DRY_RUN_PATH: &str = "/tmp/claw-secrets-dry-run";

/// Default manifest file name inside the secrets directory.
pub const DEFAULT_MANIFEST_NAME: &str = "manifest.toml";

/// Identity value meaning "the host master identity".
pub const MASTER_IDENTITY: &str = "master";

fn default_runtime_root() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_ROOT)
}

fn default_dry_run_path() -> PathBuf {
    PathBuf::from(DEFAULT_DRY_RUN_PATH)
}

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

const fn default_true() -> bool {
    true
}

/// An explicit caller-supplied secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    /// Ciphertext path.
    pub source: PathBuf,
    /// Plaintext destination.
    pub target: PathBuf,
    /// Owning user.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Owning group; defaults to the owner's primary group.
    #[serde(default)]
    pub group: Option<String>,
    /// Permission bits.
    #[serde(default)]
    pub mode: FileMode,
    /// Phase; derived from the identity when omitted.
    #[serde(default)]
    pub phase: Option<u32>,
    /// `"master"` or the name of the descriptor that produces the identity.
    #[serde(default)]
    pub identity: Option<String>,
}

impl SecretEntry {
    /// Creates a master-identity entry owned by root with mode `0400`.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            owner: default_owner(),
            group: None,
            mode: FileMode::default(),
            phase: None,
            identity: None,
        }
    }

    /// Decrypt with the identity placed by descriptor `name`.
    #[must_use]
    pub fn with_identity(mut self, name: impl Into<String>) -> Self {
        self.identity = Some(name.into());
        self
    }

    /// Pins the phase.
    #[must_use]
    pub const fn with_phase(mut self, phase: u32) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Sets the owning user.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Returns the producer name, or `None` for the master identity.
    #[must_use]
    pub fn producer(&self) -> Option<&str> {
        self.identity
            .as_deref()
            .filter(|identity| *identity != MASTER_IDENTITY)
    }
}

/// Which decrypt primitive to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecryptorConfig {
    /// Built-in X25519 sealed-file decryptor.
    #[default]
    Native,
    /// External `age`-compatible program.
    Command {
        /// Program name or path.
        #[serde(default = "default_program")]
        program: String,
        /// Extra arguments placed before the decrypt flags.
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_program() -> String {
    "age".to_string()
}

impl DecryptorConfig {
    /// Builds the configured decryptor.
    #[must_use]
    pub fn build(&self) -> Arc<dyn Decryptor> {
        match self {
            Self::Native => Arc::new(SealedBoxDecryptor::new()),
            Self::Command { program, args } => {
                Arc::new(CommandDecryptor::new(program.clone()).with_args(args.clone()))
            }
        }
    }
}

/// Main provisioning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Master identity file used for phase 1.
    pub master_identity: PathBuf,
    /// Root of the ciphertext repository.
    pub secrets_dir: PathBuf,
    /// Root of the produced plaintext tree.
    #[serde(default = "default_runtime_root")]
    pub runtime_root: PathBuf,
    /// Redirect all output under `dry_run_path`.
    #[serde(default)]
    pub dry_run: bool,
    /// Sandbox root for dry runs.
    #[serde(default = "default_dry_run_path")]
    pub dry_run_path: PathBuf,
    /// Derive descriptors from the host manifest.
    #[serde(default = "default_true")]
    pub auto_configure_from_manifest: bool,
    /// Manifest path; defaults to `<secrets_dir>/manifest.toml`.
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    /// Synthesize descriptors for ciphertexts found in `secrets_dir`.
    #[serde(default = "default_true")]
    pub discover: bool,
    /// Enable the `ssh-host-keys` section with defaults.
    #[serde(default)]
    pub ssh_host_keys: bool,
    /// Enable the `keytab` section with defaults.
    #[serde(default)]
    pub keytab: bool,
    /// Roles whose keys and secrets are provisioned.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Users whose keys and secondary manifests are provisioned.
    #[serde(default)]
    pub users: Vec<String>,
    /// Per-unit time budget.
    #[serde(default)]
    pub unit_timeout_secs: Option<u64>,
    /// Directory for readiness marker files.
    #[serde(default)]
    pub ready_dir: Option<PathBuf>,
    /// Decrypt primitive.
    #[serde(default)]
    pub decryptor: DecryptorConfig,
    /// Explicit secrets keyed by name.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretEntry>,
}

impl ProvisionConfig {
    /// Creates a configuration with defaults for everything but the layout.
    #[must_use]
    pub fn new(master_identity: impl Into<PathBuf>, secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            master_identity: master_identity.into(),
            secrets_dir: secrets_dir.into(),
            runtime_root: default_runtime_root(),
            dry_run: false,
            dry_run_path: default_dry_run_path(),
            auto_configure_from_manifest: true,
            manifest: None,
            discover: true,
            ssh_host_keys: false,
            keytab: false,
            roles: Vec::new(),
            users: Vec::new(),
            unit_timeout_secs: None,
            ready_dir: None,
            decryptor: DecryptorConfig::default(),
            secrets: BTreeMap::new(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProvisionError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("master_identity", &self.master_identity),
            ("secrets_dir", &self.secrets_dir),
            ("runtime_root", &self.runtime_root),
        ] {
            if !path.is_absolute() {
                return Err(ProvisionError::Config(format!(
                    "{what} must be an absolute path, got '{}'",
                    path.display()
                )));
            }
        }

        if self.dry_run {
            if !self.dry_run_path.is_absolute() {
                return Err(ProvisionError::Config(
                    "dry_run_path must be an absolute path".to_string(),
                ));
            }
            if self.dry_run_path.starts_with(&self.runtime_root) {
                return Err(ProvisionError::Config(
                    "dry_run_path cannot be inside runtime_root".to_string(),
                ));
            }
        }

        for role in &self.roles {
            validate_component("role", role)?;
        }
        for user in &self.users {
            validate_component("user", user)?;
        }

        if self.unit_timeout_secs == Some(0) {
            return Err(ProvisionError::Config(
                "unit_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let DecryptorConfig::Command { program, .. } = &self.decryptor {
            if program.trim().is_empty() {
                return Err(ProvisionError::Config(
                    "decryptor.program cannot be empty".to_string(),
                ));
            }
        }

        for (name, entry) in &self.secrets {
            if entry.owner.is_empty() {
                return Err(ProvisionError::Config(format!(
                    "secret '{name}' has an empty owner"
                )));
            }
            if entry.phase == Some(0) {
                return Err(ProvisionError::InvalidPhase(format!(
                    "secret '{name}' has phase 0; phases start at 1"
                )));
            }
        }

        Ok(())
    }

    /// Repository layout.
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(&self.master_identity, &self.secrets_dir, &self.runtime_root)
    }

    /// Effective manifest path.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest
            .clone()
            .unwrap_or_else(|| self.secrets_dir.join(DEFAULT_MANIFEST_NAME))
    }

    /// Production or dry-run execution mode.
    #[must_use]
    pub fn exec_mode(&self) -> ExecMode {
        if self.dry_run {
            ExecMode::dry_run(&self.dry_run_path)
        } else {
            ExecMode::Production
        }
    }

    /// Per-unit timeout, if configured.
    #[must_use]
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
        master_identity = "/etc/claw-provision/master.key"
        secrets_dir = "/var/lib/claw-provision/secrets"
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = ProvisionConfig::from_toml(MINIMAL).expect("should parse minimal config");

        assert_eq!(config.runtime_root, PathBuf::from(DEFAULT_RUNTIME_ROOT));
        assert!(!config.dry_run);
        assert!(config.auto_configure_from_manifest);
        assert!(config.discover);
        assert_eq!(config.decryptor, DecryptorConfig::Native);
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/var/lib/claw-provision/secrets/manifest.toml")
        );
        assert_eq!(config.exec_mode(), ExecMode::Production);
        assert!(config.unit_timeout().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            master_identity = "/etc/claw-provision/master.key"
            secrets_dir = "/var/lib/claw-provision/secrets"
            runtime_root = "/run/secrets"
            dry_run = true
            dry_run_path = "/tmp/sandbox"
            auto_configure_from_manifest = false
            manifest = "/etc/claw-provision/manifest.json"
            ssh_host_keys = true
            roles = ["web"]
            users = ["alice"]
            unit_timeout_secs = 30

            [decryptor]
            kind = "command"
            program = "rage"

            [secrets.db-password]
            source = "/var/lib/claw-provision/secrets/db.age"
            target = "/run/secrets/db-password"
            owner = "postgres"
            group = "postgres"
            mode = "0440"
            identity = "role-key-web"
        "#;

        let config = ProvisionConfig::from_toml(toml).expect("should parse full config");
        assert_eq!(config.exec_mode(), ExecMode::dry_run("/tmp/sandbox"));
        assert_eq!(config.unit_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.decryptor,
            DecryptorConfig::Command {
                program: "rage".to_string(),
                args: Vec::new()
            }
        );

        let db = &config.secrets["db-password"];
        assert_eq!(db.owner, "postgres");
        assert_eq!(db.mode.bits(), 0o440);
        assert_eq!(db.producer(), Some("role-key-web"));
        assert_eq!(db.phase, None);
    }

    #[test]
    fn test_entry_defaults() {
        let toml = r#"
            master_identity = "/etc/master.key"
            secrets_dir = "/srv/secrets"

            [secrets.token]
            source = "/srv/secrets/token.age"
            target = "/run/claw-secrets/token"
            identity = "master"
        "#;
        let config = ProvisionConfig::from_toml(toml).expect("parse");
        let token = &config.secrets["token"];
        assert_eq!(token.owner, "root");
        assert_eq!(token.mode, FileMode::OWNER_READ);
        assert_eq!(token.producer(), None);
    }

    #[test]
    fn test_relative_paths_rejected() {
        let toml = r#"
            master_identity = "master.key"
            secrets_dir = "/srv/secrets"
        "#;
        let err = ProvisionConfig::from_toml(toml).expect_err("relative path");
        assert!(err.to_string().contains("master_identity"));
    }

    #[test]
    fn test_dry_run_inside_runtime_root_rejected() {
        let mut config = ProvisionConfig::new("/etc/master.key", "/srv/secrets");
        config.dry_run = true;
        config.dry_run_path = PathBuf::from("/run/claw-secrets/sandbox");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsafe_names_rejected() {
        let mut config = ProvisionConfig::new("/etc/master.key", "/srv/secrets");
        config.users = vec!["../root".to_string()];
        assert!(config.validate().is_err());

        let mut config = ProvisionConfig::new("/etc/master.key", "/srv/secrets");
        config.roles = vec!["a/b".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_phase_rejected() {
        let mut config = ProvisionConfig::new("/etc/master.key", "/srv/secrets");
        config.secrets.insert(
            "x".to_string(),
            SecretEntry::new("/srv/secrets/x.age", "/run/claw-secrets/x").with_phase(0),
        );
        let err = config.validate().expect_err("phase 0");
        assert!(matches!(err, ProvisionError::InvalidPhase(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(MINIMAL.as_bytes())
            .expect("failed to write temp file");
        let config = ProvisionConfig::from_file(file.path()).expect("load");
        assert_eq!(config.secrets_dir, PathBuf::from("/var/lib/claw-provision/secrets"));
    }

    #[test]
    fn test_missing_file() {
        let err = ProvisionConfig::from_file("/nonexistent/claw-provision.toml")
            .expect_err("missing");
        assert!(matches!(err, ProvisionError::Config(_)));
    }
}
