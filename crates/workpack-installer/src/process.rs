use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Runs a command and returns its stdout, failing on a non-zero exit.
pub(crate) fn run_command_stdout(command: &mut Command, context_message: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Runs a command whose exit code carries meaning beyond success/failure.
pub(crate) fn run_command_exit_code(command: &mut Command, context_message: &str) -> Result<i32> {
    let status = command
        .status()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    status
        .code()
        .ok_or_else(|| anyhow!("{context_message}: terminated by signal"))
}
