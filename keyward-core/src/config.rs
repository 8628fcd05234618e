use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Where the agent listens for SSH clients (`SSH_AUTH_SOCK`).
    #[serde(default = "default_agent_socket", alias = "socket")]
    pub socket_path: PathBuf,
    /// Public key metadata file.  A leading `~/` is expanded from `$HOME`.
    #[serde(default = "default_storage_path", alias = "storage")]
    pub storage_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: default_agent_socket(),
            storage_path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_socket", alias = "socket")]
    pub socket_path: PathBuf,
    /// Upper bound on a single vault round trip.
    #[serde(default = "default_vault_timeout_secs")]
    pub timeout_secs: u64,
}

impl VaultConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            socket_path: default_vault_socket(),
            timeout_secs: default_vault_timeout_secs(),
        }
    }
}

/// Expand a leading `~/` using `$HOME`.  Other paths are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn default_agent_socket() -> PathBuf {
    PathBuf::from("/tmp/agent.sock")
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("~/.bunkr/agent_storage.json")
}

fn default_vault_socket() -> PathBuf {
    PathBuf::from("/tmp/bunkr_daemon.sock")
}

fn default_vault_timeout_secs() -> u64 {
    30
}
