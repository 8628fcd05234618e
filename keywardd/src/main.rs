mod bootstrap;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keyward_core::config::{Config, expand_home};
use keyward_core::{RpcVaultClient, Secret};
use keyward_ssh_agent::SshAgent;
use keyward_store::SecretStore;
use ssh_key::{HashAlg, PublicKey};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keywardd", version)]
#[command(about = "SSH agent that delegates every signature to the vault daemon", long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/keyward/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vault daemon socket [default: /tmp/bunkr_daemon.sock]
    #[arg(long, env = "KEYWARD_VAULT_SOCKET")]
    vault_socket: Option<PathBuf>,

    /// Socket the agent listens on [default: /tmp/agent.sock]
    #[arg(long, env = "KEYWARD_AGENT_SOCKET")]
    agent_socket: Option<PathBuf>,

    /// Public key metadata file [default: ~/.bunkr/agent_storage.json]
    #[arg(long, env = "KEYWARD_STORAGE")]
    storage: Option<PathBuf>,

    /// Import one key from the vault by name, then exit
    #[arg(long, value_name = "NAME", conflicts_with = "list")]
    import: Option<String>,

    /// Print every stored key, then exit
    #[arg(long)]
    list: bool,
}

impl Cli {
    /// Command-line values win over the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.vault_socket {
            config.vault.socket_path = path.clone();
        }
        if let Some(path) = &self.agent_socket {
            config.agent.socket_path = path.clone();
        }
        if let Some(path) = &self.storage {
            config.agent.storage_path = path.clone();
        }
        config.agent.storage_path = expand_home(&config.agent.storage_path);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    bootstrap::secure_bootstrap();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    cli.apply(&mut config);

    let store = SecretStore::open(&config.agent.storage_path).with_context(|| {
        format!(
            "opening key storage {}",
            config.agent.storage_path.display()
        )
    })?;

    if cli.list {
        for secret in store.list().context("reading key storage")? {
            println!("{}", describe(&secret));
        }
        return Ok(());
    }

    let vault = Arc::new(RpcVaultClient::new(&config.vault.socket_path));
    let agent = SshAgent::new(store, vault, &config.agent.socket_path)
        .with_vault_timeout(config.vault.timeout());

    if let Some(name) = &cli.import {
        let secret = agent
            .import_key(name)
            .await
            .with_context(|| format!("importing {name} from the vault"))?;
        println!("{}", describe(&secret));
        return Ok(());
    }

    let count = agent.start().await.context("loading stored keys")?;
    tracing::info!(
        keys = count,
        vault = %config.vault.socket_path.display(),
        "keywardd starting"
    );

    agent
        .run_until(shutdown_signal())
        .await
        .context("agent socket failed")?;
    Ok(())
}

/// One `--list` line: `name type group fingerprint`.
fn describe(secret: &Secret) -> String {
    let fingerprint = std::str::from_utf8(&secret.public_data)
        .ok()
        .and_then(|line| PublicKey::from_openssh(line.trim()).ok())
        .map(|key| key.fingerprint(HashAlg::Sha256).to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\t{}\t{}\t{}",
        secret.name,
        secret.secret_type,
        secret.group_name().unwrap_or("-"),
        fingerprint
    )
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("SIGTERM cannot be watched ({e}); only Ctrl-C will stop the agent");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(signal = "SIGINT", "stop requested");
            return;
        }
    };

    let name = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    tracing::info!(signal = name, "stop requested");
}

fn default_config_path() -> PathBuf {
    config_path_from(
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
    )
}

/// `$XDG_CONFIG_HOME/keyward/config.toml`, falling back to
/// `$HOME/.config`, then to a relative `keyward/config.toml`.
fn config_path_from(xdg: Option<OsString>, home: Option<OsString>) -> PathBuf {
    let base = match (xdg, home) {
        (Some(xdg), _) if !xdg.is_empty() => PathBuf::from(xdg),
        (_, Some(home)) if !home.is_empty() => PathBuf::from(home).join(".config"),
        _ => {
            tracing::warn!("no XDG_CONFIG_HOME or HOME; looking for keyward/config.toml relative to the working directory");
            PathBuf::new()
        }
    };
    base.join("keyward").join("config.toml")
}

/// Read the TOML config at `path`.  An absent file means built-in defaults.
fn load_config(path: &Path) -> Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no keyward config, running on defaults");
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading config {}", path.display()));
        }
    };

    warn_if_shared(path);

    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    tracing::info!(path = %path.display(), "keyward config loaded");
    Ok(config)
}

/// The config names sockets and the key file; others should not be able
/// to redirect them.
fn warn_if_shared(path: &Path) {
    use std::os::unix::fs::MetadataExt as _;

    match std::fs::metadata(path) {
        Ok(meta) if meta.mode() & 0o077 != 0 => tracing::warn!(
            path = %path.display(),
            mode = format!("{:o}", meta.mode() & 0o777),
            "keyward config is open to group/other; tighten it to 0600"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(path = %path.display(), "cannot stat keyward config: {e}"),
    }
}
