//! §4.4 step 2: bring up `lo` and the single NIC, acquire an address
//! (DHCP with bounded retries, or static from the cmdline), disable
//! IPv6, and pin DNS to the gateway.

use std::time::Duration;

use tokio::process::Command;

use crate::cmdline::GuestConfig;
use crate::cmd::run;
use crate::error::{GuestError, Stage};

const STAGE: Stage = Stage::Network;
const NIC: &str = "eth0";
const DHCP_RETRIES: u32 = 5;
const DHCP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The gateway address this job ended up using, needed by `mounts::setup`
/// for `resolv.conf` and by the network-check suite for its probes.
pub struct NetInfo {
    pub gateway: String,
}

pub async fn bring_up(config: &GuestConfig) -> Result<NetInfo, GuestError> {
    link_up("lo").await?;
    link_up(NIC).await?;
    disable_ipv6(NIC).await?;

    let gateway = match (&config.static_ip_cidr, &config.static_gateway) {
        (Some(cidr), Some(gateway)) => {
            configure_static(cidr, gateway).await?;
            gateway.clone()
        }
        _ => acquire_dhcp_lease().await?,
    };

    let dns = config.static_dns.clone().unwrap_or_else(|| gateway.clone());
    Ok(NetInfo { gateway: dns })
}

async fn link_up(device: &str) -> Result<(), GuestError> {
    let mut up = Command::new("ip");
    up.arg("link").arg("set").arg(device).arg("up");
    run(STAGE, &format!("link-up-{device}"), up).await?;
    Ok(())
}

async fn disable_ipv6(device: &str) -> Result<(), GuestError> {
    let mut sysctl = Command::new("sysctl");
    sysctl
        .arg("-w")
        .arg(format!("net.ipv6.conf.{device}.disable_ipv6=1"));
    run(STAGE, "disable-ipv6", sysctl).await?;
    Ok(())
}

async fn configure_static(cidr: &str, gateway: &str) -> Result<(), GuestError> {
    let mut addr = Command::new("ip");
    addr.arg("addr").arg("add").arg(cidr).arg("dev").arg(NIC);
    run(STAGE, "static-addr-add", addr).await?;

    let mut route = Command::new("ip");
    route
        .arg("route")
        .arg("add")
        .arg("default")
        .arg("via")
        .arg(gateway);
    run(STAGE, "static-default-route", route).await?;
    Ok(())
}

/// Retries a bounded number of times rather than indefinitely, matching
/// §4.4's "bounded retries" so a gateway that never answers fails the
/// job instead of hanging the worker's timeout supervision for free.
async fn acquire_dhcp_lease() -> Result<String, GuestError> {
    let mut last_err = None;
    for attempt in 0..DHCP_RETRIES {
        let mut dhcp = Command::new("udhcpc");
        dhcp.arg("-i").arg(NIC).arg("-n").arg("-q");
        match run(STAGE, "dhcp-lease", dhcp).await {
            Ok(_) => return read_gateway().await,
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(DHCP_RETRY_DELAY).await;
                let _ = attempt;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| GuestError::new(STAGE, anyhow::anyhow!("dhcp exhausted retries"))))
}

async fn read_gateway() -> Result<String, GuestError> {
    let mut route = Command::new("ip");
    route.arg("route").arg("show").arg("default");
    let output = run(STAGE, "read-default-route", route).await?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.split_whitespace()
        .skip_while(|&word| word != "via")
        .nth(1)
        .map(|s| s.to_string())
        .ok_or_else(|| GuestError::new(STAGE, anyhow::anyhow!("no default route after dhcp lease")))
}
