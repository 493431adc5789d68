//! §4.4 step 4: mount the four per-job volumes by device ordinal, build
//! the workspace/scratch overlay, and run the IaC tool inside it as an
//! unprivileged, dedicated uid.
//!
//! Device ordinals mirror the order the Sandbox Runner attaches disks in
//! (`sandbox::disk`, host side): workspace, scratch, results, validator.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::cmd::run;
use crate::error::{GuestError, Stage};

const STAGE: Stage = Stage::WorkspaceExec;

pub const WORKSPACE_DEVICE: &str = "/dev/vda";
pub const SCRATCH_DEVICE: &str = "/dev/vdb";
pub const RESULTS_DEVICE: &str = "/dev/vdc";
pub const VALIDATOR_DEVICE: &str = "/dev/vdd";

pub const WORKSPACE_MOUNT: &str = "/mnt/workspace";
pub const SCRATCH_MOUNT: &str = "/mnt/scratch";
pub const RESULTS_MOUNT: &str = "/mnt/results";
pub const VALIDATOR_MOUNT: &str = "/mnt/validator";
pub const OVERLAY_MOUNT: &str = "/mnt/overlay";

const TOOL_RELATIVE_PATH: &str = "bin/terraform";
/// Dedicated, unprivileged uid the IaC tool runs as; distinct from the
/// uid `main` itself runs as, matching §4.4's "unprivileged, dedicated
/// uid" for the tool-execution step.
const TOOL_UID: u32 = 10001;

pub struct ExecOutcome {
    pub state_json_path: PathBuf,
    pub tool_log: String,
}

pub async fn mount_volumes() -> Result<(), GuestError> {
    mount_ro(WORKSPACE_DEVICE, WORKSPACE_MOUNT).await?;
    mount_rw(SCRATCH_DEVICE, SCRATCH_MOUNT).await?;
    mount_rw(RESULTS_DEVICE, RESULTS_MOUNT).await?;
    mount_ro(VALIDATOR_DEVICE, VALIDATOR_MOUNT).await?;
    Ok(())
}

async fn mount_ro(device: &str, target: &str) -> Result<(), GuestError> {
    mount(device, target, "ro").await
}

async fn mount_rw(device: &str, target: &str) -> Result<(), GuestError> {
    mount(device, target, "rw").await
}

async fn mount(device: &str, target: &str, mode: &str) -> Result<(), GuestError> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("creating {target}: {e}")))?;
    let mut cmd = Command::new("mount");
    cmd.arg("-o").arg(mode).arg(device).arg(target);
    run(STAGE, &format!("mount-{device}"), cmd).await?;
    Ok(())
}

/// Builds the overlay (workspace read-only lower, a fresh upper/work
/// pair carved out of the scratch volume) and runs `terraform init` then
/// `terraform apply` inside it as `TOOL_UID`. The access token is never
/// passed on the command line; it is handed to the tool only via the
/// credentials file written at a path only the tool's env var names.
pub async fn run_iac_tool(token: &str) -> Result<ExecOutcome, GuestError> {
    let upper = Path::new(SCRATCH_MOUNT).join("upper");
    let work = Path::new(SCRATCH_MOUNT).join("work");
    for dir in [&upper, &work, &PathBuf::from(OVERLAY_MOUNT)] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("creating {}: {e}", dir.display())))?;
    }

    let mut overlay = Command::new("mount");
    overlay.arg("-t").arg("overlay").arg("overlay").arg("-o").arg(format!(
        "lowerdir={WORKSPACE_MOUNT},upperdir={},workdir={}",
        upper.display(),
        work.display(),
    ));
    overlay.arg(OVERLAY_MOUNT);
    run(STAGE, "mount-overlay", overlay).await?;

    let credentials_path = Path::new(SCRATCH_MOUNT).join("credentials.json");
    let credentials = serde_json::json!({ "access_token": token }).to_string();
    tokio::fs::write(&credentials_path, credentials)
        .await
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("writing credentials stub: {e}")))?;

    let tool_binary = Path::new(VALIDATOR_MOUNT).join(TOOL_RELATIVE_PATH);

    run_tool_step(&tool_binary, &credentials_path, &["init", "-no-color"]).await?;
    run_tool_step(&tool_binary, &credentials_path, &["apply", "-auto-approve", "-no-color"]).await?;
    let show_output = run_tool_step(&tool_binary, &credentials_path, &["show", "-json"]).await?;

    let state_json_path = Path::new(SCRATCH_MOUNT).join("state.json");
    tokio::fs::write(&state_json_path, &show_output)
        .await
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("writing state.json: {e}")))?;

    Ok(ExecOutcome {
        state_json_path,
        tool_log: String::new(),
    })
}

/// Runs one IaC tool subcommand under `setpriv`, inheriting stdout so
/// the output reaches the serial console the host tails into the job
/// log, and returns captured stdout for steps (like `show -json`) whose
/// output is data rather than a log.
async fn run_tool_step(tool_binary: &Path, credentials_path: &Path, args: &[&str]) -> Result<Vec<u8>, GuestError> {
    let mut cmd = Command::new("setpriv");
    cmd.arg("--reuid")
        .arg(TOOL_UID.to_string())
        .arg("--regid")
        .arg(TOOL_UID.to_string())
        .arg("--init-groups")
        .arg("--")
        .arg(tool_binary)
        .args(args)
        .current_dir(OVERLAY_MOUNT)
        .env("VALIDATION_CREDENTIALS_FILE", credentials_path);

    let output = run(STAGE, &format!("tool-{}", args.first().unwrap_or(&"")), cmd).await?;
    Ok(output.stdout)
}
