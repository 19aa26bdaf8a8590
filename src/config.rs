//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration.
///
/// Plain settings come first so `toml::to_string_pretty` can emit the
/// tables (`passwords`, `hosts`, ...) after them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address; empty means all interfaces
    pub listen: String,

    /// Listen port (default: 8022)
    pub port: u16,

    /// OpenSSH authorized_keys file accepted for every gateway user
    pub authorized_client_keys: String,

    /// Server host key files
    pub server_host_keys: Vec<String>,

    /// Private key path template for internal hosts; `{}` is replaced by `Host.sshkey`
    pub client_key: String,

    /// Greeting shown at session start; `{username}` is interpolated
    pub banner: String,

    /// Host key verification for internal hops
    pub host_key_check: HostKeyCheck,

    /// known_hosts file used by `accept-new` and `strict`
    pub known_hosts: String,

    /// Per-hop connect and handshake timeout
    pub connect_timeout_secs: u64,

    /// Username -> password hash. An empty hash means no authentication.
    /// Hashes must be Argon2 (`$argon2...`) or bcrypt (`$2b$...`); crypt(3)
    /// hashes such as `$6$` are rejected.
    pub passwords: BTreeMap<String, String>,

    pub hosts: Vec<HostConfig>,

    pub groups: Vec<GroupConfig>,

    pub permissions: Vec<PermissionConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            port: 8022,
            authorized_client_keys: "~/.ssh/authorized_keys".to_string(),
            server_host_keys: vec!["/etc/ssh/ssh_host_rsa_key".to_string()],
            client_key: "~/.ssh/{}.pem".to_string(),
            banner: "SSH Gateway, welcome {username}!".to_string(),
            host_key_check: HostKeyCheck::default(),
            known_hosts: "~/.ssh/known_hosts".to_string(),
            connect_timeout_secs: 10,
            passwords: BTreeMap::new(),
            hosts: Vec::new(),
            groups: Vec::new(),
            permissions: Vec::new(),
        }
    }
}

/// How the gateway treats host keys presented by internal hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyCheck {
    /// Accept any host key. Internal fleet hosts are trusted blindly.
    #[default]
    None,

    /// Learn unknown keys into known_hosts, reject changed ones.
    AcceptNew,

    /// Only accept keys already present in known_hosts.
    Strict,
}

/// An internal host reachable through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub sshkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionConfig {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub hostnames: Vec<String>,
}

impl GatewayConfig {
    /// Default config location: `~/.sshgateway/config.toml`.
    pub fn default_path() -> PathBuf {
        expand_tilde("~/.sshgateway/config.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Address the SSH server binds to.
    pub fn bind_addr(&self) -> (&str, u16) {
        let host = if self.listen.is_empty() {
            "0.0.0.0"
        } else {
            self.listen.as_str()
        };
        (host, self.port)
    }

    /// Private key file for a host's `sshkey` identifier.
    pub fn client_key_path(&self, sshkey: &str) -> PathBuf {
        expand_tilde(&self.client_key.replace("{}", sshkey))
    }

    pub fn authorized_keys_path(&self) -> PathBuf {
        expand_tilde(&self.authorized_client_keys)
    }

    pub fn host_key_paths(&self) -> Vec<PathBuf> {
        self.server_host_keys.iter().map(|p| expand_tilde(p)).collect()
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        expand_tilde(&self.known_hosts)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Greeting for an authenticated user.
    pub fn banner_for(&self, username: &str) -> String {
        self.banner.replace("{username}", username)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
