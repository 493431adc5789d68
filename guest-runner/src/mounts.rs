//! §4.4 step 1: minimal mounts. Pseudo-filesystems, tmpfs scratch
//! directories, and a writable `resolv.conf` bind-mounted over the
//! (read-only) rootfs's own `/etc/resolv.conf`.

use tokio::process::Command;

use crate::cmd::run;
use crate::error::{GuestError, Stage};

const STAGE: Stage = Stage::Mounts;

pub async fn setup(gateway_dns: &str) -> Result<(), GuestError> {
    mount_pseudo("proc", "/proc", "proc").await?;
    mount_pseudo("sysfs", "/sys", "sysfs").await?;
    mount_tmpfs("/tmp").await?;
    mount_tmpfs("/run").await?;
    mount_tmpfs("/var").await?;

    tokio::fs::write("/run/resolv.conf", format!("nameserver {gateway_dns}\n"))
        .await
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("writing /run/resolv.conf: {e}")))?;

    let mut bind = Command::new("mount");
    bind.arg("--bind").arg("/run/resolv.conf").arg("/etc/resolv.conf");
    run(STAGE, "bind-mount-resolv-conf", bind).await?;

    Ok(())
}

async fn mount_pseudo(fstype: &str, target: &str, name: &str) -> Result<(), GuestError> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("creating {target}: {e}")))?;
    let mut mount = Command::new("mount");
    mount.arg("-t").arg(fstype).arg(fstype).arg(target);
    run(STAGE, &format!("mount-{name}"), mount).await?;
    Ok(())
}

async fn mount_tmpfs(target: &str) -> Result<(), GuestError> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("creating {target}: {e}")))?;
    let mut mount = Command::new("mount");
    mount.arg("-t").arg("tmpfs").arg("tmpfs").arg(target);
    run(STAGE, &format!("mount-tmpfs-{target}"), mount).await?;
    Ok(())
}
