//! The in-microVM entrypoint (§4.4). Single-vCPU by construction, so a
//! `current_thread` runtime is enough and leaves one less thing that can
//! wedge during shutdown.

mod cmd;
mod cmdline;
mod error;
mod exec;
mod mounts;
mod netcheck;
mod network;
mod result;
mod state_parse;

use std::path::Path;

use error::{GuestError, Stage};
use validation_common::model::ValidationResult;

/// The bridge gateway is a fixed part of host network topology (the
/// on-host provisioner always binds its DHCP/DNS resolver and proxy to
/// this address, per §6 "host preconditions"), so `resolv.conf` can name
/// it before DHCP has even run.
const BRIDGE_GATEWAY: &str = "172.16.0.1";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let outcome = run().await;
    match &outcome {
        Ok(result) => {
            tracing::info!(status = ?result.status, score = result.score, "guest runner completed");
            result::write_success(result).await;
        }
        Err(err) => {
            tracing::error!(stage = %err.stage, error = %err.source, "guest runner failed");
            result::write_error(&err.to_string()).await;
        }
    }
    result::teardown().await;

    if outcome.is_err() {
        std::process::exit(1);
    }
}

async fn run() -> Result<ValidationResult, GuestError> {
    let config = cmdline::GuestConfig::from_proc_cmdline().await;

    mounts::setup(BRIDGE_GATEWAY).await?;
    let net_info = network::bring_up(&config).await?;

    if config.net_checks {
        netcheck::run_suite(&net_info.gateway, config.net_check_timeout).await?;
    }

    exec::mount_volumes().await?;

    let token_path = Path::new(exec::WORKSPACE_MOUNT).join(".validation-token");
    let token = tokio::fs::read_to_string(&token_path).await.unwrap_or_default();

    let task_spec_path = Path::new(exec::WORKSPACE_MOUNT).join(".task-spec.json");
    let task_spec_bytes = tokio::fs::read(&task_spec_path)
        .await
        .map_err(|e| GuestError::new(Stage::WorkspaceExec, anyhow::anyhow!("reading task spec: {e}")))?;
    let task_spec: validation_common::invariant::TaskSpec = serde_json::from_slice(&task_spec_bytes)
        .map_err(|e| GuestError::new(Stage::WorkspaceExec, anyhow::anyhow!("parsing task spec: {e}")))?;

    let exec_outcome = exec::run_iac_tool(token.trim()).await?;

    let state_bytes = tokio::fs::read(&exec_outcome.state_json_path)
        .await
        .map_err(|e| GuestError::new(Stage::Evaluation, anyhow::anyhow!("reading state.json: {e}")))?;
    let state = state_parse::parse(&state_bytes)?;

    let result = validation_evaluator::evaluate(&state, &task_spec.invariants, "serial console".to_string());
    Ok(result)
}
