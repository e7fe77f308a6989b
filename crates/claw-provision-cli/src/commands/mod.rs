//! CLI command implementations.
//!
//! - [`run`] - Full provisioning run
//! - [`plan`] - Phase plan without side effects
//! - [`unit`] - Single-secret place and remove
//! - [`teardown`] - Remove every secret

pub mod plan;
pub mod run;
pub mod teardown;
pub mod unit;

pub use plan::PlanCommand;
pub use run::RunCommand;
pub use teardown::TeardownCommand;
pub use unit::{PlaceCommand, RemoveCommand};

use std::path::Path;

use claw_provision::{ProvisionConfig, ReadyMarkers};

use crate::error::CliError;

/// Loads the configuration file, forcing dry-run when `dry_run` is set.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(path: &Path, dry_run: bool) -> Result<ProvisionConfig, CliError> {
    let mut config = ProvisionConfig::from_file(path)?;
    if dry_run && !config.dry_run {
        config.dry_run = true;
        config.validate()?;
    }
    Ok(config)
}

/// Readiness markers for `config`, redirected to the sandbox in dry-run.
#[must_use]
pub fn ready_markers(config: &ProvisionConfig) -> Option<ReadyMarkers> {
    config
        .ready_dir
        .as_ref()
        .map(|dir| ReadyMarkers::new(config.exec_mode().effective(dir)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[test]
    fn dry_run_flag_overrides_config() {
        let file = write_config(
            "master_identity = \"/etc/master.key\"\nsecrets_dir = \"/srv/secrets\"\n",
        );
        let config = load_config(file.path(), true).expect("load");
        assert!(config.dry_run);
        let config = load_config(file.path(), false).expect("load");
        assert!(!config.dry_run);
    }

    #[test]
    fn dry_run_flag_revalidates() {
        let file = write_config(
            "master_identity = \"/etc/master.key\"\nsecrets_dir = \"/srv/secrets\"\ndry_run_path = \"/run/claw-secrets/sandbox\"\n",
        );
        assert!(load_config(file.path(), false).is_ok());
        assert!(load_config(file.path(), true).is_err());
    }

    #[test]
    fn markers_follow_exec_mode() {
        let mut config = ProvisionConfig::new("/etc/master.key", "/srv/secrets");
        assert!(ready_markers(&config).is_none());

        config.ready_dir = Some("/run/claw-provision".into());
        config.dry_run = true;
        config.dry_run_path = "/tmp/sandbox".into();
        let markers = ready_markers(&config).expect("markers");
        assert_eq!(markers.dir(), Path::new("/tmp/sandbox/run/claw-provision"));
    }
}
