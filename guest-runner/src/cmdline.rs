//! Parses the normative `acore_*` kernel cmdline keys (§6) that the
//! Sandbox Runner's `BootCmdline` renders, the guest side of that
//! contract. Absent keys default to DHCP and no probes, matching the
//! host-side default.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct GuestConfig {
    pub net_checks: bool,
    pub net_check_timeout: Duration,
    pub static_ip_cidr: Option<String>,
    pub static_gateway: Option<String>,
    pub static_dns: Option<String>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            net_checks: false,
            net_check_timeout: Duration::from_secs(5),
            static_ip_cidr: None,
            static_gateway: None,
            static_dns: None,
        }
    }
}

impl GuestConfig {
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();
        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "acore_net_checks" => config.net_checks = value == "1",
                "acore_net_check_timeout" => {
                    if let Ok(secs) = value.parse::<u64>() {
                        config.net_check_timeout = Duration::from_secs(secs);
                    }
                }
                "acore_static_ip" => config.static_ip_cidr = Some(value.to_string()),
                "acore_static_gw" => config.static_gateway = Some(value.to_string()),
                "acore_static_dns" => config.static_dns = Some(value.to_string()),
                _ => {}
            }
        }
        config
    }

    pub async fn from_proc_cmdline() -> Self {
        match tokio::fs::read_to_string("/proc/cmdline").await {
            Ok(cmdline) => Self::parse(&cmdline),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_dhcp_and_no_probes_on_empty_cmdline() {
        let config = GuestConfig::parse("");
        assert!(!config.net_checks);
        assert!(config.static_ip_cidr.is_none());
    }

    #[test]
    fn parses_every_normative_key() {
        let config = GuestConfig::parse(
            "console=ttyS0 reboot=k acore_net_checks=1 acore_net_check_timeout=12 \
             acore_static_ip=10.0.0.5/24 acore_static_gw=10.0.0.1 acore_static_dns=10.0.0.1",
        );
        assert!(config.net_checks);
        assert_eq!(config.net_check_timeout, Duration::from_secs(12));
        assert_eq!(config.static_ip_cidr.as_deref(), Some("10.0.0.5/24"));
        assert_eq!(config.static_gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.static_dns.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn net_checks_0_is_disabled() {
        let config = GuestConfig::parse("acore_net_checks=0");
        assert!(!config.net_checks);
    }
}
