//! §4.4 step 3: the deterministic egress-policy probe suite. Every probe
//! must resolve as expected, in order; the first one that doesn't fails
//! the whole suite with a reason naming that probe (scenario 5, §8).

use std::time::Duration;

use tokio::process::Command;

use crate::error::{GuestError, Stage};

const STAGE: Stage = Stage::NetworkChecks;

/// Domain the host allowlist is expected to carry; chosen to be the kind
/// of host a Terraform provider plugin actually needs (module/provider
/// registry), not a probe-only placeholder.
const ALLOWLISTED_HOST: &str = "registry.terraform.io";
/// A domain that is never on the allowlist, used as the negative case.
const DENIED_HOST: &str = "example.com";
const METADATA_ADDR: &str = "169.254.169.254";
const PROXY_PORT: u16 = 3128;

pub async fn run_suite(gateway: &str, timeout: Duration) -> Result<(), GuestError> {
    probe("direct-egress-without-proxy-must-fail", async {
        !curl_succeeds(&format!("https://{ALLOWLISTED_HOST}"), None, timeout).await?
    })
    .await?;

    probe("dns-resolves-allowlisted-domain", async {
        resolves(ALLOWLISTED_HOST, timeout).await?
    })
    .await?;

    probe("dns-sinkholes-denylisted-domain", async {
        !resolves(DENIED_HOST, timeout).await?
    })
    .await?;

    let proxy = format!("http://{gateway}:{PROXY_PORT}");

    probe("proxy-egress-succeeds-for-allowlisted-host", async {
        curl_succeeds(&format!("https://{ALLOWLISTED_HOST}"), Some(&proxy), timeout).await?
    })
    .await?;

    probe("proxy-egress-fails-for-non-allowlisted-host", async {
        !curl_succeeds(&format!("https://{DENIED_HOST}"), Some(&proxy), timeout).await?
    })
    .await?;

    probe("cloud-metadata-endpoint-is-unreachable", async {
        !curl_succeeds(&format!("http://{METADATA_ADDR}/"), None, timeout).await?
    })
    .await?;

    Ok(())
}

async fn probe<F>(name: &str, check: F) -> Result<(), GuestError>
where
    F: std::future::Future<Output = Result<bool, GuestError>>,
{
    if check.await? {
        Ok(())
    } else {
        Err(GuestError::new(STAGE, anyhow::anyhow!("probe failed: {name}")))
    }
}

async fn curl_succeeds(url: &str, proxy: Option<&str>, timeout: Duration) -> Result<bool, GuestError> {
    let mut cmd = Command::new("curl");
    cmd.arg("--max-time")
        .arg(timeout.as_secs().max(1).to_string())
        .arg("-sS")
        .arg("-o")
        .arg("/dev/null");
    if let Some(proxy) = proxy {
        cmd.arg("-x").arg(proxy);
    }
    cmd.arg(url);

    let status = tokio::time::timeout(timeout + Duration::from_secs(2), cmd.status())
        .await
        .map_err(|_| GuestError::new(STAGE, anyhow::anyhow!("probe against {url} hung past its own timeout")))?
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("spawning curl for {url}: {e}")))?;

    Ok(status.success())
}

async fn resolves(host: &str, timeout: Duration) -> Result<bool, GuestError> {
    let mut cmd = Command::new("getent");
    cmd.arg("ahostsv4").arg(host);
    let output = tokio::time::timeout(timeout + Duration::from_secs(2), cmd.output())
        .await
        .map_err(|_| GuestError::new(STAGE, anyhow::anyhow!("resolving {host} hung past its own timeout")))?
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("spawning getent for {host}: {e}")))?;

    if !output.status.success() {
        return Ok(false);
    }
    let resolved = String::from_utf8_lossy(&output.stdout);
    Ok(!resolved.trim().is_empty() && !resolved.contains("0.0.0.0"))
}
