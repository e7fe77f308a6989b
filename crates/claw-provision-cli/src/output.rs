//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

use claw_provision::{EntryStatus, PhaseBatch, ProvisionReport, SecretDescriptor, UnitStatus};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

impl TableDisplay for ProvisionReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.dry_run {
            writeln!(writer, "(dry run)")?;
        }
        if self.units.is_empty() {
            writeln!(writer, "No secrets to provision")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:<32}  {:>5}  {:<8}  DETAIL",
            "NAME", "PHASE", "STATUS"
        )?;
        writeln!(writer, "{}", "─".repeat(80))?;

        for unit in &self.units {
            let detail = match (&unit.error, &unit.target) {
                (Some(error), _) => error.clone(),
                (None, Some(target)) => target.display().to_string(),
                (None, None) => String::new(),
            };
            writeln!(
                writer,
                "{:<32}  {:>5}  {:<8}  {}",
                truncate(&unit.name, 32),
                unit.phase,
                unit.status,
                detail
            )?;
            for entry in &unit.entries {
                let status = match entry.status {
                    EntryStatus::Placed => "placed",
                    EntryStatus::Missing => "missing",
                    EntryStatus::Failed => "failed",
                };
                let detail = entry
                    .error
                    .clone()
                    .or_else(|| entry.target.as_ref().map(|t| t.display().to_string()))
                    .unwrap_or_default();
                writeln!(
                    writer,
                    "  └ {:<28}  {:>5}  {:<8}  {}",
                    truncate(&entry.name, 28),
                    "",
                    status,
                    detail
                )?;
            }
        }

        let warnings: Vec<_> = self.warnings().collect();
        if !warnings.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "Warnings")?;
            for warning in warnings {
                writeln!(writer, "  {warning}")?;
            }
        }

        writeln!(writer)?;
        writeln!(
            writer,
            "Placed: {}  Failed: {}  Skipped: {}  Removed: {}",
            self.count(UnitStatus::Placed),
            self.count(UnitStatus::Failed),
            self.count(UnitStatus::Skipped),
            self.count(UnitStatus::Removed)
        )?;
        Ok(())
    }
}

/// One unit in a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedUnit {
    /// Descriptor name.
    pub name: String,
    /// Where the descriptor came from.
    pub origin: String,
    /// Ciphertext path.
    pub source: PathBuf,
    /// Production target path.
    pub target: PathBuf,
    /// `owner:group`.
    pub ownership: String,
    /// Octal mode.
    pub mode: String,
    /// `master` or the producing descriptor's name.
    pub identity: String,
}

impl From<&SecretDescriptor> for PlannedUnit {
    fn from(d: &SecretDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            origin: d.origin.to_string(),
            source: d.source.clone(),
            target: d.target.clone(),
            ownership: format!("{}:{}", d.owner, d.group.as_deref().unwrap_or("-")),
            mode: d.mode.to_string(),
            identity: d.identity.producer().unwrap_or("master").to_string(),
        }
    }
}

/// One phase in a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedPhase {
    /// Phase number.
    pub phase: u32,
    /// Units in the phase.
    pub units: Vec<PlannedUnit>,
}

/// The phase plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Whether writes would go to the sandbox.
    pub dry_run: bool,
    /// Phases in execution order.
    pub phases: Vec<PlannedPhase>,
}

impl Plan {
    /// Builds a plan view from scheduled batches.
    #[must_use]
    pub fn new(dry_run: bool, batches: &[PhaseBatch]) -> Self {
        Self {
            dry_run,
            phases: batches
                .iter()
                .map(|b| PlannedPhase {
                    phase: b.phase,
                    units: b.descriptors.iter().map(PlannedUnit::from).collect(),
                })
                .collect(),
        }
    }
}

impl TableDisplay for Plan {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.phases.is_empty() {
            writeln!(writer, "No secrets to provision")?;
            return Ok(());
        }

        for phase in &self.phases {
            writeln!(writer, "Phase {}", phase.phase)?;
            writeln!(writer, "══════════════════════════════════")?;
            writeln!(
                writer,
                "{:<32}  {:<14}  {:<20}  {:<5}  {:<16}  TARGET",
                "NAME", "ORIGIN", "OWNER", "MODE", "IDENTITY"
            )?;
            for unit in &phase.units {
                writeln!(
                    writer,
                    "{:<32}  {:<14}  {:<20}  {:<5}  {:<16}  {}",
                    truncate(&unit.name, 32),
                    truncate(&unit.origin, 14),
                    truncate(&unit.ownership, 20),
                    unit.mode,
                    truncate(&unit.identity, 16),
                    unit.target.display()
                )?;
            }
            writeln!(writer)?;
        }

        let total: usize = self.phases.iter().map(|p| p.units.len()).sum();
        writeln!(
            writer,
            "Total: {total} secret(s) in {} phase(s){}",
            self.phases.len(),
            if self.dry_run { " (dry run)" } else { "" }
        )?;
        Ok(())
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    } else {
        s.chars().take(max_len).collect()
    }
}
