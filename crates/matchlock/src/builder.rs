use crate::hooks::VfsInterceptionConfig;
use crate::types::{CreateOptions, ImageConfig, MountConfig, Secret};

/// Fluent builder for sandbox configuration. Purely functional: nothing
/// here touches the supervisor.
///
/// ```no_run
/// use matchlock::Sandbox;
///
/// let sandbox = Sandbox::new("python:3.12-alpine")
///     .allow_host(["api.anthropic.com"])
///     .add_secret("ANTHROPIC_API_KEY", "sk-...", ["api.anthropic.com"]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Sandbox {
    opts: CreateOptions,
}

impl Sandbox {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            opts: CreateOptions::new(image),
        }
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.opts.cpus = cpus;
        self
    }

    pub fn with_memory(mut self, mb: u32) -> Self {
        self.opts.memory_mb = mb;
        self
    }

    pub fn with_disk_size(mut self, mb: u32) -> Self {
        self.opts.disk_size_mb = mb;
        self
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.opts.timeout_seconds = seconds;
        self
    }

    pub fn with_workspace(mut self, path: impl Into<String>) -> Self {
        self.opts.workspace = path.into();
        self
    }

    pub fn allow_host(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.opts
            .allowed_hosts
            .extend(hosts.into_iter().map(Into::into));
        self
    }

    pub fn block_private_ips(mut self) -> Self {
        self.opts.block_private_ips = Some(true);
        self
    }

    pub fn add_secret(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.opts.secrets.push(Secret::new(name, value, hosts));
        self
    }

    pub fn with_dns_servers(mut self, servers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.opts
            .dns_servers
            .extend(servers.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.env.insert(name.into(), value.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.opts.hostname = hostname.into();
        self
    }

    pub fn with_network_mtu(mut self, mtu: u32) -> Self {
        self.opts.network_mtu = mtu;
        self
    }

    pub fn with_image_config(mut self, config: ImageConfig) -> Self {
        self.opts.image_config = Some(config);
        self
    }

    pub fn with_vfs_interception(mut self, config: VfsInterceptionConfig) -> Self {
        self.opts.vfs_interception = Some(config);
        self
    }

    pub fn mount(mut self, guest_path: impl Into<String>, config: MountConfig) -> Self {
        self.opts.mounts.insert(guest_path.into(), config);
        self
    }

    pub fn mount_host_dir(
        self,
        guest_path: impl Into<String>,
        host_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        self.mount(guest_path, MountConfig::real_fs(host_path))
    }

    pub fn mount_host_dir_readonly(
        self,
        guest_path: impl Into<String>,
        host_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        self.mount(guest_path, MountConfig::real_fs(host_path).read_only())
    }

    pub fn mount_memory(self, guest_path: impl Into<String>) -> Self {
        self.mount(guest_path, MountConfig::memory())
    }

    pub fn mount_overlay(
        self,
        guest_path: impl Into<String>,
        host_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        self.mount(guest_path, MountConfig::overlay(host_path))
    }

    pub fn options(&self) -> &CreateOptions {
        &self.opts
    }

    pub fn into_options(self) -> CreateOptions {
        self.opts
    }
}
