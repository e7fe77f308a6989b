//! Readiness marker files.
//!
//! Supervisors that cannot subscribe to the in-process barriers wait on
//! marker files instead: one empty file per [`Barrier`], created as the
//! barrier fires.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::debug;

use crate::error::Result;
use crate::fsops;
use crate::scheduler::Barrier;

/// Writes barrier marker files under a directory.
#[derive(Debug, Clone)]
pub struct ReadyMarkers {
    dir: PathBuf,
}

impl ReadyMarkers {
    /// Markers under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Marker path for `barrier`.
    #[must_use]
    pub fn path(&self, barrier: Barrier) -> PathBuf {
        self.dir.join(barrier.as_str())
    }

    /// Removes every marker left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a marker exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        for barrier in Barrier::ALL {
            fsops::remove_file(&self.path(barrier))?;
        }
        Ok(())
    }

    /// Creates the marker for every barrier up to and including `reached`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or a marker cannot be created.
    pub fn mark(&self, reached: Barrier) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for barrier in Barrier::ALL.into_iter().filter(|b| *b <= reached) {
            let path = self.path(barrier);
            if !path.exists() {
                std::fs::write(&path, b"")?;
                debug!(marker = %path.display(), "readiness marker written");
            }
        }
        Ok(())
    }

    /// Writes markers as `rx` advances, until every barrier has fired or
    /// the sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a marker cannot be written.
    pub async fn follow(&self, mut rx: watch::Receiver<Barrier>) -> Result<()> {
        loop {
            let current = *rx.borrow_and_update();
            self.mark(current)?;
            if current == Barrier::AllSecretsReady || rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// The marker directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
