//! # claw-provision-cli
//!
//! Command-line front end for node secret provisioning.
//!
//! The host supervisor either calls `run` once and waits on the readiness
//! markers, or drives units one at a time with `place`:
//!
//! ```text
//! claw-provision plan                 # what would happen
//! claw-provision run                  # everything, phase by phase
//! claw-provision place role-key-web   # one unit
//! claw-provision teardown             # remove all plaintext
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format};
pub use error::CliError;
pub use output::OutputFormat;
