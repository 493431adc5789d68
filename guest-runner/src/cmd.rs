//! Typed, bounded subprocess wrapper, the guest-side twin of the Sandbox
//! Runner's `SandboxStep` (§9 "subprocess supervision over raw shell"
//! applies equally inside the guest: every mount, network, and tool
//! invocation is a named command with a timeout and captured output).

use std::time::Duration;

use tokio::process::Command;

use crate::error::{GuestError, Stage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `command`, bounded by `timeout`, and turns a timeout or non-zero
/// exit into a `GuestError` tagged with `stage`.
pub async fn run_step(
    stage: Stage,
    name: &str,
    mut command: Command,
    timeout: Duration,
) -> Result<std::process::Output, GuestError> {
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| GuestError::new(stage, anyhow::anyhow!("{name} timed out after {timeout:?}")))?
        .map_err(|source| GuestError::new(stage, anyhow::anyhow!("{name} failed to spawn: {source}")))?;

    if !output.status.success() {
        return Err(GuestError::new(
            stage,
            anyhow::anyhow!(
                "{name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }
    Ok(output)
}

/// `run_step` with the default 30s timeout, for the common case.
pub async fn run(stage: Stage, name: &str, command: Command) -> Result<std::process::Output, GuestError> {
    run_step(stage, name, command, DEFAULT_TIMEOUT).await
}
