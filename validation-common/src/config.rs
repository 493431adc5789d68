use crate::safe_display::SafeDisplay;
use crate::tracing_config::TracingConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Generic TOML-file-plus-env-override config loader, mirroring the
/// teacher's `golem_common::config::ConfigLoader`. The environment
/// prefix is `VALIDATION_` and nested keys use `__` as a separator
/// (`VALIDATION_POOL__WORKERS=4`).
pub struct ConfigLoader<T> {
    pub config_file_name: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn load(&self) -> figment::Result<T> {
        let default = T::default();
        let mut figment = Figment::from(Serialized::defaults(default));
        if self.config_file_name.exists() {
            figment = figment.merge(Toml::file(&self.config_file_name));
        }
        figment = figment.merge(Env::prefixed("VALIDATION_").split("__"));
        figment.extract()
    }
}

/// Root configuration for the validation-service binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    pub ingestion: IngestionConfig,
    pub pool: PoolConfig,
    pub sandbox: SandboxConfig,
    pub paths: PathsConfig,
    pub credential: CredentialConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("validation-service"),
            http_port: 8082,
            ingestion: IngestionConfig::default(),
            pool: PoolConfig::default(),
            sandbox: SandboxConfig::default(),
            paths: PathsConfig::default(),
            credential: CredentialConfig::default(),
        }
    }
}

impl SafeDisplay for ServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "http_port: {}", self.http_port);
        let _ = writeln!(&mut result, "ingestion:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.ingestion.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "pool:");
        let _ = writeln!(&mut result, "{}", self.pool.to_safe_string_indented());
        let _ = writeln!(&mut result, "sandbox:");
        let _ = writeln!(&mut result, "{}", self.sandbox.to_safe_string_indented());
        let _ = writeln!(&mut result, "paths:");
        let _ = writeln!(&mut result, "{}", self.paths.to_safe_string_indented());
        let _ = writeln!(&mut result, "credential:");
        let _ = writeln!(&mut result, "{}", self.credential.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Archives must resolve under this root, or submission is rejected (403).
    pub archive_root: Option<PathBuf>,
    pub max_total_bytes: u64,
    pub max_file_bytes: u64,
    pub max_entry_count: u32,
    pub max_path_depth: u32,
    /// Extensions the sanitizer allows to survive ingestion.
    pub allowed_extensions: Vec<String>,
    /// Directory/file names the sanitizer strips unconditionally.
    pub denied_names: Vec<String>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            archive_root: None,
            max_total_bytes: 64 * 1024 * 1024,
            max_file_bytes: 16 * 1024 * 1024,
            max_entry_count: 2048,
            max_path_depth: 16,
            allowed_extensions: vec![
                "tf".to_string(),
                "tfvars".to_string(),
                "json".to_string(),
                "md".to_string(),
            ],
            denied_names: vec![
                ".terraform".to_string(),
                ".terraform.lock.hcl".to_string(),
                "terraform.tfstate".to_string(),
                "terraform.tfstate.backup".to_string(),
            ],
        }
    }
}

impl SafeDisplay for IngestionConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "archive_root: {:?}",
            self.archive_root.as_deref().unwrap_or(Path::new("<none>"))
        );
        let _ = writeln!(&mut result, "max_total_bytes: {}", self.max_total_bytes);
        let _ = writeln!(&mut result, "max_file_bytes: {}", self.max_file_bytes);
        let _ = writeln!(&mut result, "max_entry_count: {}", self.max_entry_count);
        let _ = writeln!(&mut result, "max_path_depth: {}", self.max_path_depth);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub tap_device_prefix: String,
    pub default_timeout_s: u32,
    pub max_timeout_s: u32,
    /// Fraction (0,1) of remaining token lifetime at which the credential
    /// manager pre-emptively refreshes.
    pub token_refresh_fraction: f64,
    pub token_mint_deadline_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 16,
            tap_device_prefix: "tap-val".to_string(),
            default_timeout_s: 120,
            max_timeout_s: 600,
            token_refresh_fraction: 0.2,
            token_mint_deadline_ms: 2000,
        }
    }
}

impl SafeDisplay for PoolConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "workers: {}", self.workers);
        let _ = writeln!(&mut result, "queue_capacity: {}", self.queue_capacity);
        let _ = writeln!(
            &mut result,
            "tap_device_prefix: {}",
            self.tap_device_prefix
        );
        let _ = writeln!(
            &mut result,
            "default_timeout_s: {}",
            self.default_timeout_s
        );
        let _ = writeln!(&mut result, "max_timeout_s: {}", self.max_timeout_s);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub chroot_root: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub validator_bundle_image: PathBuf,
    pub jailer_binary: PathBuf,
    pub jailer_uid: u32,
    pub jailer_gid: u32,
    pub shutdown_grace_ms: u64,
    pub workspace_disk_mb: u64,
    pub scratch_disk_mb: u64,
    pub results_disk_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            chroot_root: PathBuf::from("/var/lib/validation-engine/chroot"),
            kernel_image: PathBuf::from("/var/lib/validation-engine/vmlinux"),
            rootfs_image: PathBuf::from("/var/lib/validation-engine/rootfs.ext4"),
            validator_bundle_image: PathBuf::from("/var/lib/validation-engine/validator-bundle.ext4"),
            jailer_binary: PathBuf::from("/usr/bin/jailer"),
            jailer_uid: 10000,
            jailer_gid: 10000,
            shutdown_grace_ms: 3000,
            workspace_disk_mb: 64,
            scratch_disk_mb: 256,
            results_disk_mb: 16,
        }
    }
}

impl SafeDisplay for SandboxConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "chroot_root: {:?}", self.chroot_root);
        let _ = writeln!(&mut result, "kernel_image: {:?}", self.kernel_image);
        let _ = writeln!(&mut result, "rootfs_image: {:?}", self.rootfs_image);
        let _ = writeln!(
            &mut result,
            "validator_bundle_image: {:?}",
            self.validator_bundle_image
        );
        let _ = writeln!(&mut result, "jailer_binary: {:?}", self.jailer_binary);
        let _ = writeln!(&mut result, "jailer_uid: {}", self.jailer_uid);
        let _ = writeln!(&mut result, "jailer_gid: {}", self.jailer_gid);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/validation-engine/data"),
        }
    }
}

impl PathsConfig {
    pub fn submissions_dir(&self, task_id: &str) -> PathBuf {
        self.data_root.join("submissions").join(task_id)
    }

    pub fn logs_dir(&self, task_id: &str) -> PathBuf {
        self.data_root.join("logs").join(task_id)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_root.join("jobs")
    }

    pub fn workspace_dir(&self, job_id: impl std::fmt::Display) -> PathBuf {
        self.data_root.join("workspaces").join(job_id.to_string())
    }
}

impl SafeDisplay for PathsConfig {
    fn to_safe_string(&self) -> String {
        format!("data_root: {:?}\n", self.data_root)
    }
}

/// Where the read-only cloud-provider identity comes from (§4.2
/// "Credential manager", §1 Non-goals: "authenticating as anything but a
/// read-only identity"). The provisioner deposits a token at
/// `token_file`; the engine only ever reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub token_file: PathBuf,
    pub token_lifetime_s: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("/var/lib/validation-engine/cloud-token"),
            token_lifetime_s: 3600,
        }
    }
}

impl SafeDisplay for CredentialConfig {
    fn to_safe_string(&self) -> String {
        format!("token_file: {:?}\ntoken_lifetime_s: {}\n", self.token_file, self.token_lifetime_s)
    }
}

pub fn make_config_loader() -> ConfigLoader<ServiceConfig> {
    ConfigLoader::new(Path::new("config/validation-service.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads_without_a_file() {
        let loader: ConfigLoader<ServiceConfig> = ConfigLoader::new(Path::new(
            "/nonexistent/validation-service.toml",
        ));
        let config = loader.load().expect("default config should load");
        assert_eq!(config.pool.workers, 4);
    }

    #[test]
    fn safe_string_never_contains_archive_root_secret_marker() {
        let config = ServiceConfig::default();
        let safe = config.to_safe_string();
        assert!(safe.contains("http_port"));
    }
}
