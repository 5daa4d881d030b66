use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hooks::{VfsInterceptionConfig, WireInterception};

pub const MATCHLOCK_BIN_ENV: &str = "MATCHLOCK_BIN";
const DEFAULT_BINARY: &str = "matchlock";

/// Client configuration, immutable for the client's lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Path to the supervisor binary.
    pub binary_path: PathBuf,
    /// Run the supervisor under sudo (needed for TAP devices on Linux).
    pub use_sudo: bool,
}

impl Default for Config {
    /// Resolve the binary from `MATCHLOCK_BIN` when set. The env var is
    /// consulted here and nowhere else.
    fn default() -> Self {
        let binary_path = std::env::var_os(MATCHLOCK_BIN_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY));
        Self {
            binary_path,
            use_sudo: false,
        }
    }
}

impl Config {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            use_sudo: false,
        }
    }

    pub fn with_sudo(mut self) -> Self {
        self.use_sudo = true;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    #[default]
    Memory,
    RealFs,
    Overlay,
}

/// One VFS mount, serialized into `create`'s `vfs.mounts` keyed by guest path.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountConfig {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
}

impl MountConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn real_fs(host_path: impl Into<PathBuf>) -> Self {
        Self {
            mount_type: MountType::RealFs,
            host_path: Some(host_path.into()),
            readonly: false,
        }
    }

    pub fn overlay(host_path: impl Into<PathBuf>) -> Self {
        Self {
            mount_type: MountType::Overlay,
            host_path: Some(host_path.into()),
            readonly: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// Secret injected into the sandbox. The value leaves this process only as
/// an RPC param; inside the VM it is a placeholder substituted by the
/// supervisor's MITM proxy on requests to the listed hosts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub value: String,
    /// Host globs where the secret may be used.
    pub hosts: Vec<String>,
}

impl Secret {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

/// OCI image metadata overrides (USER, WORKDIR, ENTRYPOINT, CMD, ENV).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ImageConfig {
    fn is_empty(&self) -> bool {
        self.user.is_empty()
            && self.working_dir.is_empty()
            && self.entrypoint.is_empty()
            && self.cmd.is_empty()
            && self.env.is_empty()
    }
}

/// Options consumed once by `Client::create`.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Container image reference (required, e.g. `alpine:latest`).
    pub image: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u32,
    pub timeout_seconds: u32,
    pub allowed_hosts: Vec<String>,
    /// Tri-state: `None` leaves the supervisor default in place.
    pub block_private_ips: Option<bool>,
    /// Mounts keyed by guest path.
    pub mounts: BTreeMap<String, MountConfig>,
    /// Non-secret environment variables for commands in the VM.
    pub env: BTreeMap<String, String>,
    pub vfs_interception: Option<VfsInterceptionConfig>,
    pub secrets: Vec<Secret>,
    /// Guest mount point for the VFS (supervisor default: /workspace).
    pub workspace: String,
    pub dns_servers: Vec<String>,
    pub hostname: String,
    pub network_mtu: u32,
    pub image_config: Option<ImageConfig>,
}

impl CreateOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Assemble the nested `create` params, omitting unset sub-trees.
    /// `interception` is the wire-safe hook config produced by the compiler;
    /// callback rules never appear in it.
    pub(crate) fn to_create_params(&self, interception: Option<WireInterception>) -> CreateParams {
        let resources = ResourceParams {
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            disk_size_mb: self.disk_size_mb,
            timeout_seconds: self.timeout_seconds,
        };
        let resources = (!resources.is_empty()).then_some(resources);

        let network = NetworkParams {
            allowed_hosts: self.allowed_hosts.clone(),
            block_private_ips: self.block_private_ips,
            secrets: self
                .secrets
                .iter()
                .map(|secret| {
                    (
                        secret.name.clone(),
                        SecretParams {
                            value: secret.value.clone(),
                            hosts: secret.hosts.clone(),
                        },
                    )
                })
                .collect(),
            dns_servers: self.dns_servers.clone(),
            hostname: (!self.hostname.is_empty()).then(|| self.hostname.clone()),
            mtu: (self.network_mtu > 0).then_some(self.network_mtu),
        };
        let network = (!network.is_empty()).then_some(network);

        let vfs = VfsParams {
            mounts: self.mounts.clone(),
            workspace: (!self.workspace.is_empty()).then(|| self.workspace.clone()),
            interception,
        };
        let vfs = (!vfs.is_empty()).then_some(vfs);

        let image_config = self
            .image_config
            .as_ref()
            .filter(|config| !config.is_empty())
            .cloned();

        CreateParams {
            image: self.image.clone(),
            resources,
            network,
            vfs,
            env: (!self.env.is_empty()).then(|| self.env.clone()),
            image_config,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub(crate) struct CreateParams {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfs: Option<VfsParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_config: Option<ImageConfig>,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct ResourceParams {
    #[serde(skip_serializing_if = "is_zero")]
    pub cpus: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub memory_mb: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub disk_size_mb: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub timeout_seconds: u32,
}

impl ResourceParams {
    fn is_empty(&self) -> bool {
        self.cpus == 0 && self.memory_mb == 0 && self.disk_size_mb == 0 && self.timeout_seconds == 0
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub(crate) struct NetworkParams {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_private_ips: Option<bool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretParams>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl NetworkParams {
    fn is_empty(&self) -> bool {
        self.allowed_hosts.is_empty()
            && self.block_private_ips.is_none()
            && self.secrets.is_empty()
            && self.dns_servers.is_empty()
            && self.hostname.is_none()
            && self.mtu.is_none()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct SecretParams {
    pub value: String,
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub(crate) struct VfsParams {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mounts: BTreeMap<String, MountConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interception: Option<WireInterception>,
}

impl VfsParams {
    fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.workspace.is_none() && self.interception.is_none()
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Result of `Client::exec`. stdout/stderr are lossily decoded text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Result of `Client::exec_stream`; output bytes were already delivered to
/// the caller's sinks, so only the terminal state remains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecStreamResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    #[serde(default)]
    pub is_dir: bool,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn default_config_falls_back_to_matchlock() {
        // Guard: only valid while MATCHLOCK_BIN is unset in the test env.
        if std::env::var_os(MATCHLOCK_BIN_ENV).is_none() {
            let config = Config::default();
            assert_eq!(config.binary_path, PathBuf::from("matchlock"));
            assert!(!config.use_sudo);
        }
    }

    #[test]
    fn mount_config_minimal_wire_shape() {
        let mount = MountConfig::memory();
        assert_eq!(
            serde_json::to_value(&mount).expect("serialize"),
            json!({"type": "memory"})
        );
    }

    #[test]
    fn mount_config_full_wire_shape() {
        let mount = MountConfig::real_fs("/src").read_only();
        assert_eq!(
            serde_json::to_value(&mount).expect("serialize"),
            json!({"type": "real_fs", "host_path": "/src", "readonly": true})
        );
    }

    #[test]
    fn mount_config_omits_readonly_false() {
        let mount = MountConfig::overlay("/data");
        let value = serde_json::to_value(&mount).expect("serialize");
        assert_eq!(value.get("readonly"), None);
        assert_eq!(value["type"], "overlay");
    }

    #[test]
    fn create_params_minimal() {
        let opts = CreateOptions::new("alpine:latest");
        let params = opts.to_create_params(None);
        assert_eq!(
            serde_json::to_value(&params).expect("serialize"),
            json!({"image": "alpine:latest"})
        );
    }

    #[test]
    fn create_params_resources_omit_zero_fields() {
        let mut opts = CreateOptions::new("img");
        opts.cpus = 2;
        opts.timeout_seconds = 300;
        let value = serde_json::to_value(opts.to_create_params(None)).expect("serialize");
        assert_eq!(
            value["resources"],
            json!({"cpus": 2, "timeout_seconds": 300})
        );
    }

    #[test]
    fn create_params_network_present_with_secrets() {
        let mut opts = CreateOptions::new("img");
        opts.allowed_hosts = vec!["a.com".to_owned()];
        opts.block_private_ips = Some(true);
        opts.secrets = vec![Secret::new("K", "V", ["a.com"])];
        let value = serde_json::to_value(opts.to_create_params(None)).expect("serialize");
        assert_eq!(
            value["network"],
            json!({
                "allowed_hosts": ["a.com"],
                "block_private_ips": true,
                "secrets": {"K": {"value": "V", "hosts": ["a.com"]}}
            })
        );
        assert_eq!(value.get("vfs"), None);
    }

    #[test]
    fn create_params_network_present_with_hostname_and_mtu() {
        let mut opts = CreateOptions::new("img");
        opts.hostname = "box".to_owned();
        opts.network_mtu = 1400;
        let value = serde_json::to_value(opts.to_create_params(None)).expect("serialize");
        assert_eq!(value["network"], json!({"hostname": "box", "mtu": 1400}));
    }

    #[test]
    fn create_params_vfs_present_with_mounts_and_workspace() {
        let mut opts = CreateOptions::new("img");
        opts.workspace = "/code".to_owned();
        opts.mounts
            .insert("/data".to_owned(), MountConfig::real_fs("/h"));
        let value = serde_json::to_value(opts.to_create_params(None)).expect("serialize");
        assert_eq!(
            value["vfs"],
            json!({
                "mounts": {"/data": {"type": "real_fs", "host_path": "/h"}},
                "workspace": "/code"
            })
        );
        assert_eq!(value.get("network"), None);
    }

    #[test]
    fn create_params_env_and_image_config() {
        let mut opts = CreateOptions::new("img");
        opts.env.insert("FOO".to_owned(), "bar".to_owned());
        opts.image_config = Some(ImageConfig {
            user: "1000:1000".to_owned(),
            working_dir: "/app".to_owned(),
            ..ImageConfig::default()
        });
        let value = serde_json::to_value(opts.to_create_params(None)).expect("serialize");
        assert_eq!(value["env"], json!({"FOO": "bar"}));
        assert_eq!(
            value["image_config"],
            json!({"user": "1000:1000", "working_dir": "/app"})
        );
    }

    #[test]
    fn create_params_empty_image_config_omitted() {
        let mut opts = CreateOptions::new("img");
        opts.image_config = Some(ImageConfig::default());
        let value = serde_json::to_value(opts.to_create_params(None)).expect("serialize");
        assert_eq!(value.get("image_config"), None);
    }

    #[test]
    fn file_info_decodes_wire_entry() {
        let info: FileInfo =
            serde_json::from_value(json!({"name": "hello.txt", "size": 5, "mode": 420, "is_dir": false}))
                .expect("decode");
        assert_eq!(info.name, "hello.txt");
        assert_eq!(info.size, 5);
        assert_eq!(info.mode, 0o644);
        assert!(!info.is_dir);
    }
}
