//! Command execution for cmdrelay.
//!
//! Every command a backend proposes runs through [`Safeguard`] before
//! [`ShellExecutor`] spawns a process for it.

mod error;
mod safeguard;
mod shell;

pub use error::{Result, ToolError};
pub use safeguard::{SAFEGUARD_PROMPT, Safeguard, SafeguardRule, Verdict};
pub use shell::{CommandRun, RunStatus, ShellExecutor, ShellPolicy};
