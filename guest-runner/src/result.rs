//! §4.4 steps 5–6: write the result document to the results volume via
//! write-to-temp-and-rename, `sync`, then unmount every volume this
//! process touched — on both the success and the failure path, which is
//! what makes "exactly one of success.json or error.json is present"
//! (§6) hold even when an earlier stage failed.

use std::path::Path;

use tokio::process::Command;

use validation_common::model::ValidationResult;

use crate::exec::{OVERLAY_MOUNT, RESULTS_MOUNT, SCRATCH_MOUNT, VALIDATOR_MOUNT, WORKSPACE_MOUNT};

const SUCCESS_FILE: &str = "success.json";
const ERROR_FILE: &str = "error.json";

pub async fn write_success(result: &ValidationResult) {
    let body = serde_json::to_vec_pretty(result).unwrap_or_else(|_| b"{}".to_vec());
    write_result_file(SUCCESS_FILE, &body).await;
}

pub async fn write_error(message: &str) {
    let body = serde_json::json!({ "status": "fail", "message": message }).to_string();
    write_result_file(ERROR_FILE, body.as_bytes()).await;
}

/// Best-effort: the results volume may not even be mounted yet if an
/// early stage failed, so mount failures here are swallowed rather than
/// compounding the original error.
async fn write_result_file(name: &str, body: &[u8]) {
    let _ = tokio::fs::create_dir_all(RESULTS_MOUNT).await;
    if !is_mounted(RESULTS_MOUNT).await {
        let _ = mount_best_effort(crate::exec::RESULTS_DEVICE, RESULTS_MOUNT).await;
    }

    let final_path = Path::new(RESULTS_MOUNT).join(name);
    let staging_path = Path::new(RESULTS_MOUNT).join(format!(".{name}.tmp"));

    if tokio::fs::write(&staging_path, body).await.is_ok() {
        let _ = tokio::fs::rename(&staging_path, &final_path).await;
    }

    let _ = Command::new("sync").status().await;
}

/// Unmounts every mount point the guest runner may have created, in
/// reverse dependency order, regardless of which succeeded. Called on
/// every exit path.
pub async fn teardown() {
    let _ = Command::new("umount").arg(OVERLAY_MOUNT).status().await;
    for mount in [WORKSPACE_MOUNT, SCRATCH_MOUNT, RESULTS_MOUNT, VALIDATOR_MOUNT] {
        let _ = Command::new("umount").arg(mount).status().await;
    }
}

async fn is_mounted(target: &str) -> bool {
    tokio::fs::metadata(target).await.is_ok()
        && Command::new("mountpoint")
            .arg("-q")
            .arg(target)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
}

async fn mount_best_effort(device: &str, target: &str) -> std::io::Result<std::process::ExitStatus> {
    Command::new("mount").arg("-o").arg("rw").arg(device).arg(target).status().await
}
