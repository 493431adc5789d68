//! Per-job ext4 disk image helpers (§4.3 step 2) and the guest-boot
//! cmdline builder (§6 "Guest-boot cmdline keys").

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use super::step::{SandboxStep, StepError};

const DISK_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates an empty ext4 image of `size_mb` megabytes at `dest`.
pub async fn create_empty_image(dest: &Path, size_mb: u64) -> Result<(), StepError> {
    let mut truncate = Command::new("truncate");
    truncate.arg("-s").arg(format!("{size_mb}M")).arg(dest);
    SandboxStep::new("truncate-disk", truncate, DISK_STEP_TIMEOUT)
        .run()
        .await?;

    let mut mkfs = Command::new("mkfs.ext4");
    mkfs.arg("-q").arg(dest);
    SandboxStep::new("mkfs-disk", mkfs, DISK_STEP_TIMEOUT)
        .run()
        .await?;
    Ok(())
}

/// Creates an ext4 image at `dest` whose contents are a copy of
/// `src_dir`, used for the read-only workspace disk. The source
/// directory is never mutated.
pub async fn create_image_from_dir(
    dest: &Path,
    src_dir: &Path,
    size_mb: u64,
    mount_root: &Path,
) -> Result<(), StepError> {
    create_empty_image(dest, size_mb).await?;

    tokio::fs::create_dir_all(mount_root)
        .await
        .map_err(|source| StepError::Spawn {
            name: "create-mount-point".to_string(),
            source,
        })?;

    let mut mount = Command::new("mount");
    mount.arg("-o").arg("loop").arg(dest).arg(mount_root);
    SandboxStep::new("mount-loop", mount, DISK_STEP_TIMEOUT)
        .run()
        .await?;

    let copy_result = async {
        let mut copy = Command::new("cp");
        copy.arg("-a")
            .arg(format!("{}/.", src_dir.display()))
            .arg(mount_root);
        SandboxStep::new("copy-into-image", copy, DISK_STEP_TIMEOUT)
            .run()
            .await
    }
    .await;

    let mut sync = Command::new("sync");
    let _ = SandboxStep::new("sync-image", sync.arg("-f"), DISK_STEP_TIMEOUT)
        .run()
        .await;

    let mut umount = Command::new("umount");
    umount.arg(mount_root);
    let unmount_result = SandboxStep::new("unmount-loop", umount, DISK_STEP_TIMEOUT)
        .run()
        .await;

    copy_result?;
    unmount_result?;
    Ok(())
}

pub async fn delete_image(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

/// Builds the guest kernel cmdline from the per-job flags, matching the
/// normative keys in §6: `acore_net_checks`, `acore_net_check_timeout`,
/// `acore_static_ip`, `acore_static_gw`, `acore_static_dns`. Absent keys
/// default to DHCP and no probes, so this only ever appends keys for
/// flags that are actually set.
pub struct BootCmdline {
    pub net_checks: bool,
    pub net_check_timeout_s: u32,
    pub static_ip_cidr: Option<String>,
    pub static_gateway: Option<String>,
    pub static_dns: Option<String>,
    pub quiet_kernel: bool,
}

impl BootCmdline {
    pub fn render(&self) -> String {
        let mut tokens = vec!["reboot=k".to_string(), "panic=1".to_string()];
        if self.quiet_kernel {
            tokens.push("quiet".to_string());
        }
        tokens.push(format!(
            "acore_net_checks={}",
            if self.net_checks { 1 } else { 0 }
        ));
        if self.net_checks {
            tokens.push(format!("acore_net_check_timeout={}", self.net_check_timeout_s));
        }
        if let Some(cidr) = &self.static_ip_cidr {
            tokens.push(format!("acore_static_ip={cidr}"));
        }
        if let Some(gw) = &self.static_gateway {
            tokens.push(format!("acore_static_gw={gw}"));
        }
        if let Some(dns) = &self.static_dns {
            tokens.push(format!("acore_static_dns={dns}"));
        }
        tokens.join(" ")
    }
}

pub fn job_chroot_dir(chroot_root: &Path, job_id: &str) -> PathBuf {
    chroot_root.join(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cmdline_defaults_to_dhcp_and_no_probes() {
        let cmdline = BootCmdline {
            net_checks: false,
            net_check_timeout_s: 5,
            static_ip_cidr: None,
            static_gateway: None,
            static_dns: None,
            quiet_kernel: false,
        };
        let rendered = cmdline.render();
        assert!(rendered.contains("acore_net_checks=0"));
        assert!(!rendered.contains("acore_static_ip"));
        assert!(!rendered.contains("acore_net_check_timeout"));
    }

    #[test]
    fn net_checks_enabled_carries_timeout() {
        let cmdline = BootCmdline {
            net_checks: true,
            net_check_timeout_s: 10,
            static_ip_cidr: None,
            static_gateway: None,
            static_dns: None,
            quiet_kernel: false,
        };
        let rendered = cmdline.render();
        assert!(rendered.contains("acore_net_checks=1"));
        assert!(rendered.contains("acore_net_check_timeout=10"));
    }

    #[test]
    fn static_ip_carries_gateway_and_dns() {
        let cmdline = BootCmdline {
            net_checks: false,
            net_check_timeout_s: 5,
            static_ip_cidr: Some("10.0.0.5/24".to_string()),
            static_gateway: Some("10.0.0.1".to_string()),
            static_dns: Some("10.0.0.1".to_string()),
            quiet_kernel: true,
        };
        let rendered = cmdline.render();
        assert!(rendered.contains("acore_static_ip=10.0.0.5/24"));
        assert!(rendered.contains("acore_static_gw=10.0.0.1"));
        assert!(rendered.contains("quiet"));
    }
}
