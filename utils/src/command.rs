//! Helpers for executing subprocesses.

use std::process::Command;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Given a `Command` that has been executed, return an error if it failed,
/// folding any captured stderr into the message.
fn command_status_to_result(cmd: &Command, output: std::process::Output) -> Result<Vec<u8>> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            anyhow::bail!("{cmd:?} failed: {}", output.status);
        }
        anyhow::bail!("{cmd:?} failed: {}: {stderr}", output.status);
    }
    Ok(output.stdout)
}

/// Extension helpers for `std::process::Command`.
pub trait CommandRunExt {
    /// Execute the child process, capturing its output; on failure the
    /// error includes the child's stderr.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process, returning its stdout as a `String`.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and parse its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        tracing::debug!("exec: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("spawning {self:?}"))?;
        command_status_to_result(self, output)?;
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        tracing::debug!("exec: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("spawning {self:?}"))?;
        let stdout = command_status_to_result(self, output)?;
        String::from_utf8(stdout).map_err(Into::into)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        tracing::debug!("exec: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("spawning {self:?}"))?;
        let stdout = command_status_to_result(self, output)?;
        serde_json::from_slice(&stdout).with_context(|| format!("parsing output of {self:?}"))
    }
}
