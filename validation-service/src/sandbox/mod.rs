//! The Sandbox Runner (§4.3): builds a jailed chroot, attaches ephemeral
//! per-job disks, boots the microVM through the jailer, supervises it
//! under a timeout, and harvests the result. Modeled as a trait
//! (`SandboxRunner`) over a concrete `FirecrackerSandboxRunner`, mirroring
//! the provider/handle split in the pack's VM-manager sandbox backend —
//! the Worker Pool depends only on the trait, so tests can substitute a
//! fake runner without any real jailer/KVM on hand.

mod disk;
mod step;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use validation_common::config::SandboxConfig;
use validation_common::model::ValidationResult;
use validation_common::redact::redact_all;

use disk::BootCmdline;
use step::{SandboxStep, StepError};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox runner invoked as uid 0; refusing to run unprivileged workload as root")]
    RunningAsRoot,
    #[error("disk setup failed: {0}")]
    DiskSetup(#[source] StepError),
    #[error("chroot setup failed: {0}")]
    ChrootSetup(#[source] std::io::Error),
    #[error("jailer spawn failed: {0}")]
    JailerSpawn(#[source] std::io::Error),
    #[error("vm supervision timed out after {0}s")]
    Timeout(u32),
    #[error("vm exited with non-zero status: {0}")]
    GuestNonZeroExit(String),
    #[error("result volume mount failed: {0}")]
    HarvestMount(#[source] StepError),
    #[error("job was cancelled")]
    Cancelled,
}

pub struct SandboxJobContext {
    pub job_id: String,
    pub workspace_path: PathBuf,
    pub task_spec_json: Vec<u8>,
    pub timeout_s: u32,
    pub tap_device: String,
    pub access_token: String,
    pub net_checks: bool,
    pub quiet_kernel: bool,
    pub stream_log: bool,
    pub log_path: PathBuf,
    pub cancellation: CancellationToken,
}

pub struct SandboxOutcome {
    pub result: ValidationResult,
    pub log_tail: String,
}

/// One `--drive` attachment, in the ordinal position the Guest Runner
/// assumes (§4.3 step 2 / §6): the Nth drive here becomes `/dev/vd<N>`.
struct DriveSpec {
    path: PathBuf,
    read_only: bool,
}

/// Runs exactly one Job through the full sandbox lifecycle. Implementors
/// own teardown: by the time `run_job` returns, no disk, mount, or
/// chroot directory for that job remains, on every exit path including
/// cancellation.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run_job(&self, ctx: SandboxJobContext) -> SandboxOutcome;
}

pub struct FirecrackerSandboxRunner {
    config: SandboxConfig,
}

impl FirecrackerSandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// §4.3: "declines to run when the invoking uid is 0". Checked once
    /// at startup, not per job, since the uid cannot change mid-process.
    /// Shells out to `id -u` rather than an FFI `getuid` call, matching
    /// the "every host-side step is a typed command" design note even
    /// for this one-off startup check.
    pub async fn check_not_root() -> Result<(), SandboxError> {
        let output = tokio::process::Command::new("id")
            .arg("-u")
            .output()
            .await
            .map_err(SandboxError::ChrootSetup)?;
        let uid_str = String::from_utf8_lossy(&output.stdout);
        if uid_str.trim() == "0" {
            return Err(SandboxError::RunningAsRoot);
        }
        Ok(())
    }

    async fn run_job_steps(
        &self,
        ctx: &SandboxJobContext,
        teardown: &mut Teardown,
        log_tail: &mut String,
    ) -> Result<ValidationResult, SandboxError> {
        let chroot_dir = disk::job_chroot_dir(&self.config.chroot_root, &ctx.job_id);
        tokio::fs::create_dir_all(&chroot_dir)
            .await
            .map_err(SandboxError::ChrootSetup)?;
        teardown.chroot_dir = Some(chroot_dir.clone());

        let rootfs_copy = chroot_dir.join("rootfs.ext4");
        tokio::fs::copy(&self.config.rootfs_image, &rootfs_copy)
            .await
            .map_err(SandboxError::ChrootSetup)?;

        // Token injection: the only credential delivery channel into the
        // guest is a file staged into the workspace before it's sealed
        // into the read-only image below.
        let token_path = ctx.workspace_path.join(".validation-token");
        tokio::fs::write(&token_path, &ctx.access_token)
            .await
            .map_err(SandboxError::ChrootSetup)?;

        // The task spec travels into the guest the same way, staged
        // before the image is built, so the Guest Runner can read it
        // without any in-band control channel back to the host (§4.4
        // "by convention over device ordinals, not by any in-band
        // control channel").
        let task_spec_path = ctx.workspace_path.join(".task-spec.json");
        tokio::fs::write(&task_spec_path, &ctx.task_spec_json)
            .await
            .map_err(SandboxError::ChrootSetup)?;

        let workspace_disk = chroot_dir.join("workspace.ext4");
        let workspace_mount = chroot_dir.join("mnt-workspace");
        disk::create_image_from_dir(
            &workspace_disk,
            &ctx.workspace_path,
            self.config.workspace_disk_mb,
            &workspace_mount,
        )
        .await
        .map_err(SandboxError::DiskSetup)?;
        teardown.disks.push(workspace_disk.clone());

        let scratch_disk = chroot_dir.join("scratch.ext4");
        disk::create_empty_image(&scratch_disk, self.config.scratch_disk_mb)
            .await
            .map_err(SandboxError::DiskSetup)?;
        teardown.disks.push(scratch_disk.clone());

        let results_disk = chroot_dir.join("results.ext4");
        disk::create_empty_image(&results_disk, self.config.results_disk_mb)
            .await
            .map_err(SandboxError::DiskSetup)?;
        teardown.disks.push(results_disk.clone());

        // The validator bundle is operator-provided and shared across every
        // job; a per-job copy is attached (and torn down) so that deleting
        // it at the end of this job never removes the one other jobs still
        // need.
        let validator_bundle_copy = chroot_dir.join("validator-bundle.ext4");
        tokio::fs::copy(&self.config.validator_bundle_image, &validator_bundle_copy)
            .await
            .map_err(SandboxError::ChrootSetup)?;
        teardown.disks.push(validator_bundle_copy.clone());

        let cmdline = BootCmdline {
            net_checks: ctx.net_checks,
            net_check_timeout_s: ctx.timeout_s.min(30),
            static_ip_cidr: None,
            static_gateway: None,
            static_dns: None,
            quiet_kernel: ctx.quiet_kernel,
        }
        .render();

        // Ordinal order here is the contract the Guest Runner relies on to
        // find `/dev/vda`..`/dev/vdd` (§4.3 step 2): workspace, scratch,
        // results, validator.
        let drives = [
            DriveSpec { path: workspace_disk.clone(), read_only: true },
            DriveSpec { path: scratch_disk.clone(), read_only: false },
            DriveSpec { path: results_disk.clone(), read_only: false },
            DriveSpec { path: validator_bundle_copy.clone(), read_only: true },
        ];

        let child = self
            .spawn_jailer(&chroot_dir, &rootfs_copy, &cmdline, &drives)
            .await?;
        self.supervise(child, ctx, log_tail).await?;

        self.harvest(&results_disk, &chroot_dir, &ctx.log_path, &ctx.access_token)
            .await
    }

    async fn spawn_jailer(
        &self,
        chroot_dir: &std::path::Path,
        rootfs_copy: &std::path::Path,
        cmdline: &str,
        drives: &[DriveSpec],
    ) -> Result<tokio::process::Child, SandboxError> {
        let mut command = tokio::process::Command::new(&self.config.jailer_binary);
        command
            .arg("--uid")
            .arg(self.config.jailer_uid.to_string())
            .arg("--gid")
            .arg(self.config.jailer_gid.to_string())
            .arg("--chroot-base-dir")
            .arg(chroot_dir)
            .arg("--kernel")
            .arg(&self.config.kernel_image)
            .arg("--rootfs")
            .arg(rootfs_copy)
            .arg("--boot-args")
            .arg(cmdline);

        for drive in drives {
            command.arg("--drive").arg(format!(
                "path={},readonly={}",
                drive.path.display(),
                drive.read_only
            ));
        }

        command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        command.spawn().map_err(SandboxError::JailerSpawn)
    }

    async fn supervise(
        &self,
        mut child: tokio::process::Child,
        ctx: &SandboxJobContext,
        log_tail: &mut String,
    ) -> Result<(), SandboxError> {
        let mut job_log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.log_path)
            .await
            .map_err(SandboxError::ChrootSetup)?;

        let stdout = child.stdout.take();
        let tail_task = stdout.map(|stdout| {
            let stream_log = ctx.stream_log;
            let access_token = ctx.access_token.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut buffered = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    let redacted = redact_all(&line, &[access_token.as_str()]);
                    buffered.push(redacted);
                    if stream_log {
                        tracing::debug!(serial = %buffered.last().unwrap());
                    }
                }
                buffered.join("\n")
            })
        });

        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(Duration::from_secs(ctx.timeout_s as u64)) => None,
            _ = ctx.cancellation.cancelled() => None,
        };

        let status = match wait_result {
            Some(Ok(status)) => status,
            Some(Err(err)) => return Err(SandboxError::ChrootSetup(err)),
            None => {
                // Either the timeout elapsed or cancellation was requested:
                // graceful shutdown, then a hard kill after the grace period.
                let pid = child.id();
                if let Some(pid) = pid {
                    let mut term = tokio::process::Command::new("kill");
                    term.arg("-TERM").arg(pid.to_string());
                    let _ = SandboxStep::new("graceful-shutdown", term, Duration::from_secs(5))
                        .run()
                        .await;
                }
                let grace = Duration::from_millis(self.config.shutdown_grace_ms);
                let exited_gracefully =
                    tokio::time::timeout(grace, child.wait()).await.is_ok();
                if !exited_gracefully {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                if let Some(tail) = tail_task {
                    if let Ok(tail_text) = tail.await {
                        let _ = job_log.write_all(tail_text.as_bytes()).await;
                        *log_tail = tail_text;
                    }
                }
                if ctx.cancellation.is_cancelled() {
                    return Err(SandboxError::Cancelled);
                }
                return Err(SandboxError::Timeout(ctx.timeout_s));
            }
        };

        if let Some(tail) = tail_task {
            if let Ok(tail_text) = tail.await {
                job_log
                    .write_all(tail_text.as_bytes())
                    .await
                    .map_err(SandboxError::ChrootSetup)?;
                *log_tail = tail_text;
            }
        }

        if !status.success() {
            return Err(SandboxError::GuestNonZeroExit(status.to_string()));
        }
        Ok(())
    }

    async fn harvest(
        &self,
        results_disk: &std::path::Path,
        chroot_dir: &std::path::Path,
        log_path: &std::path::Path,
        access_token: &str,
    ) -> Result<ValidationResult, SandboxError> {
        let mount_root = chroot_dir.join("mnt-results");
        tokio::fs::create_dir_all(&mount_root)
            .await
            .map_err(SandboxError::ChrootSetup)?;

        let mut mount = tokio::process::Command::new("mount");
        mount
            .arg("-o")
            .arg("loop,ro")
            .arg(results_disk)
            .arg(&mount_root);
        SandboxStep::new("mount-results-ro", mount, Duration::from_secs(10))
            .run()
            .await
            .map_err(SandboxError::HarvestMount)?;

        let logs_ref = log_path.display().to_string();
        let success_path = mount_root.join("success.json");
        let error_path = mount_root.join("error.json");

        let result = if let Ok(bytes) = tokio::fs::read(&success_path).await {
            serde_json::from_slice::<ValidationResult>(&bytes)
                .unwrap_or_else(|_| ValidationResult::fail_closed("malformed success.json", logs_ref.clone()))
        } else if let Ok(bytes) = tokio::fs::read(&error_path).await {
            let message = String::from_utf8_lossy(&bytes).into_owned();
            ValidationResult::fail_closed(&redact_all(&message, &[access_token]), logs_ref.clone())
        } else {
            ValidationResult::fail_closed("no result file produced by guest runner", logs_ref.clone())
        };

        let mut umount = tokio::process::Command::new("umount");
        umount.arg(&mount_root);
        let _ = SandboxStep::new("unmount-results", umount, Duration::from_secs(10))
            .run()
            .await;

        Ok(result)
    }
}

/// Tracks every disk/chroot directory created during a job so teardown
/// can run unconditionally, regardless of which step failed.
#[derive(Default)]
struct Teardown {
    chroot_dir: Option<PathBuf>,
    disks: Vec<PathBuf>,
}

impl Teardown {
    async fn execute(self) {
        for disk in self.disks {
            disk::delete_image(&disk).await;
        }
        if let Some(chroot_dir) = self.chroot_dir {
            let _ = tokio::fs::remove_dir_all(&chroot_dir).await;
        }
    }
}

#[async_trait]
impl SandboxRunner for FirecrackerSandboxRunner {
    async fn run_job(&self, ctx: SandboxJobContext) -> SandboxOutcome {
        let logs_ref = ctx.log_path.display().to_string();
        let mut teardown = Teardown::default();
        let mut log_tail = String::new();
        let outcome = self.run_job_steps(&ctx, &mut teardown, &mut log_tail).await;
        teardown.execute().await;

        let result = outcome.unwrap_or_else(|err| {
            tracing::warn!(job_id = %ctx.job_id, error = %err, "sandbox job failed");
            ValidationResult::fail_closed(&err.to_string(), logs_ref)
        });

        SandboxOutcome { result, log_tail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPassRunner;

    #[async_trait]
    impl SandboxRunner for AlwaysPassRunner {
        async fn run_job(&self, ctx: SandboxJobContext) -> SandboxOutcome {
            SandboxOutcome {
                result: ValidationResult::from_detail(vec![], ctx.log_path.display().to_string()),
                log_tail: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn trait_object_is_usable_through_dyn_dispatch() {
        let runner: std::sync::Arc<dyn SandboxRunner> = std::sync::Arc::new(AlwaysPassRunner);
        let ctx = SandboxJobContext {
            job_id: "job-1".to_string(),
            workspace_path: PathBuf::from("/tmp"),
            task_spec_json: vec![],
            timeout_s: 5,
            tap_device: "tap-val0".to_string(),
            access_token: "secret-token".to_string(),
            net_checks: false,
            quiet_kernel: false,
            stream_log: false,
            log_path: PathBuf::from("/tmp/job-1.log"),
            cancellation: CancellationToken::new(),
        };
        let outcome = runner.run_job(ctx).await;
        assert_eq!(outcome.result.total_invariants, 0);
    }
}
