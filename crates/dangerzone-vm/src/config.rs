use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_VM_NAME: &str = "dangerzone";
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_MEMORY: &str = "2G";
pub const DEFAULT_DISK: &str = "10G";
pub const DEFAULT_IMAGE: &str = "20.04";
pub const DEFAULT_CONTAINER_RUNTIME: &str = "podman";
pub const DEFAULT_CONTAINER_IMAGE: &str = "docker.io/flmcode/dangerzone";
pub const DEFAULT_INSTALLER_URL: &str = "https://multipass.run/download/macos";
pub const DEFAULT_KEY_NAME: &str = "id_ed25519";
pub const DEFAULT_KEY_COMMENT: &str = "dangerzone";

const MACOS_APP_BUNDLE: &str = "/Applications/Multipass.app";
const MACOS_RUNTIME_BIN: &str = "/usr/local/bin/multipass";
const CACHE_DIR_NAME: &str = "dangerzone";

/// Host platform, as far as runtime installation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Self::MacOs,
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }
}

/// Everything the provisioning components need to know, passed explicitly
/// into each of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    pub platform: Platform,
    /// `multipass` executable used for list/launch/start/exec.
    pub runtime_bin: PathBuf,
    /// App bundle whose presence marks an installed runtime.
    pub app_bundle: PathBuf,
    pub installer_url: String,
    /// `open` executable used to run the installer and launch the app.
    pub open_bin: PathBuf,
    pub ssh_keygen_bin: PathBuf,
    pub key_dir: PathBuf,
    pub key_name: String,
    pub key_comment: String,
    /// Scratch space for downloads and rendered bootstrap files.
    pub cache_dir: PathBuf,
    pub vm_name: String,
    pub cpus: u32,
    pub memory: String,
    pub disk: String,
    pub image: String,
    pub container_runtime: String,
    pub container_image: String,
    /// Replaces the built-in cloud-init template when set.
    pub bootstrap_template: Option<PathBuf>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let platform = Platform::current();
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(CACHE_DIR_NAME);
        let runtime_bin = match platform {
            Platform::MacOs => PathBuf::from(MACOS_RUNTIME_BIN),
            _ => PathBuf::from("multipass"),
        };
        Self {
            platform,
            runtime_bin,
            app_bundle: PathBuf::from(MACOS_APP_BUNDLE),
            installer_url: DEFAULT_INSTALLER_URL.to_string(),
            open_bin: PathBuf::from("open"),
            ssh_keygen_bin: PathBuf::from("ssh-keygen"),
            key_dir: cache_dir.join("ssh"),
            key_name: DEFAULT_KEY_NAME.to_string(),
            key_comment: DEFAULT_KEY_COMMENT.to_string(),
            cache_dir,
            vm_name: DEFAULT_VM_NAME.to_string(),
            cpus: DEFAULT_CPUS,
            memory: DEFAULT_MEMORY.to_string(),
            disk: DEFAULT_DISK.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            container_runtime: DEFAULT_CONTAINER_RUNTIME.to_string(),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            bootstrap_template: None,
        }
    }
}

/// Partial configuration, e.g. loaded from a TOML file or CLI flags.
/// Blank strings are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub runtime_bin: Option<PathBuf>,
    pub installer_url: Option<String>,
    pub key_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub vm_name: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub disk: Option<String>,
    pub image: Option<String>,
    pub container_runtime: Option<String>,
    pub container_image: Option<String>,
    pub bootstrap_template: Option<PathBuf>,
}

impl ProvisionConfig {
    /// Apply `DANGERZONE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(overrides_from_env(|key| std::env::var(key).ok()))
    }

    pub fn with_overrides(mut self, o: ConfigOverrides) -> Self {
        if let Some(v) = non_empty_path(o.runtime_bin) {
            self.runtime_bin = v;
        }
        if let Some(v) = non_empty(o.installer_url) {
            self.installer_url = v;
        }
        if let Some(v) = non_empty_path(o.key_dir) {
            self.key_dir = v;
        }
        if let Some(v) = non_empty_path(o.cache_dir) {
            self.cache_dir = v;
        }
        if let Some(v) = non_empty(o.vm_name) {
            self.vm_name = v;
        }
        if let Some(v) = o.cpus.filter(|n| *n > 0) {
            self.cpus = v;
        }
        if let Some(v) = non_empty(o.memory) {
            self.memory = v;
        }
        if let Some(v) = non_empty(o.disk) {
            self.disk = v;
        }
        if let Some(v) = non_empty(o.image) {
            self.image = v;
        }
        if let Some(v) = non_empty(o.container_runtime) {
            self.container_runtime = v;
        }
        if let Some(v) = non_empty(o.container_image) {
            self.container_image = v;
        }
        if let Some(v) = non_empty_path(o.bootstrap_template) {
            self.bootstrap_template = Some(v);
        }
        self
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.key_dir.join(&self.key_name)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.pub", self.key_name))
    }
}

fn overrides_from_env(get: impl Fn(&str) -> Option<String>) -> ConfigOverrides {
    ConfigOverrides {
        runtime_bin: get("DANGERZONE_MULTIPASS_BIN").map(PathBuf::from),
        installer_url: get("DANGERZONE_INSTALLER_URL"),
        key_dir: get("DANGERZONE_KEY_DIR").map(PathBuf::from),
        cache_dir: get("DANGERZONE_CACHE_DIR").map(PathBuf::from),
        vm_name: get("DANGERZONE_VM_NAME"),
        cpus: get("DANGERZONE_VM_CPUS").and_then(|raw| raw.trim().parse().ok()),
        memory: get("DANGERZONE_VM_MEMORY"),
        disk: get("DANGERZONE_VM_DISK"),
        image: get("DANGERZONE_VM_IMAGE"),
        container_runtime: get("DANGERZONE_CONTAINER_RUNTIME"),
        container_image: get("DANGERZONE_CONTAINER_IMAGE"),
        bootstrap_template: get("DANGERZONE_BOOTSTRAP_TEMPLATE").map(PathBuf::from),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|p| !p.as_os_str().is_empty())
}
