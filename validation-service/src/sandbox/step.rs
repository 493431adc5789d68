//! `SandboxStep`: the typed command-with-timeout wrapper named in
//! SPEC_FULL's Sandbox Runner module. Every host-side procedure step
//! (create disk, mount, build chroot, spawn jailer, tear down) goes
//! through this instead of ad-hoc `Command::new(...).spawn()` calls, so
//! a single place enforces "bounded and captured" subprocess behavior
//! (spec.md §9, "subprocess supervision over raw shell").

use std::time::Duration;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step {name} timed out after {timeout_ms}ms")]
    TimedOut { name: String, timeout_ms: u64 },
    #[error("step {name} failed to spawn: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("step {name} exited with status {status}: {stderr}")]
    NonZeroExit {
        name: String,
        status: String,
        stderr: String,
    },
}

/// A single bounded host-side subprocess invocation.
pub struct SandboxStep {
    name: String,
    command: Command,
    timeout: Duration,
}

impl SandboxStep {
    pub fn new(name: impl Into<String>, command: Command, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command,
            timeout,
        }
    }

    /// Runs the step to completion, capturing stdout/stderr, and maps a
    /// non-zero exit or timeout into a `StepError` naming the step.
    pub async fn run(mut self) -> Result<std::process::Output, StepError> {
        let name = self.name.clone();
        let timeout_ms = self.timeout.as_millis() as u64;
        let output = tokio::time::timeout(self.timeout, self.command.output())
            .await
            .map_err(|_| StepError::TimedOut {
                name: name.clone(),
                timeout_ms,
            })?
            .map_err(|source| StepError::Spawn {
                name: name.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(StepError::NonZeroExit {
                name,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_returns_output() {
        let mut cmd = Command::new("true");
        cmd.kill_on_drop(true);
        let step = SandboxStep::new("noop", cmd, Duration::from_secs(5));
        assert!(step.run().await.is_ok());
    }

    #[tokio::test]
    async fn failing_command_is_named_in_the_error() {
        let mut cmd = Command::new("false");
        cmd.kill_on_drop(true);
        let step = SandboxStep::new("deliberate-failure", cmd, Duration::from_secs(5));
        let err = step.run().await.unwrap_err();
        assert!(matches!(err, StepError::NonZeroExit { name, .. } if name == "deliberate-failure"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5").kill_on_drop(true);
        let step = SandboxStep::new("slow", cmd, Duration::from_millis(50));
        let err = step.run().await.unwrap_err();
        assert!(matches!(err, StepError::TimedOut { .. }));
    }
}
