use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

use crate::{
    address::RemoteAddress,
    handshake::{Credentials, HttpConnectHandshake},
};

/// Default time a caller waits for the proxied connect before cancelling it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "proxy-connect", version, about)]
pub struct ConnectArgs {
    /// Destination to reach through the proxy, as `host:port`.
    pub target: RemoteAddress,

    /// HTTP proxy to tunnel through, as `host:port`.
    #[arg(long, env = "PROXY_ADDRESS")]
    pub proxy: Option<RemoteAddress>,

    /// User name for proxy basic authentication.
    #[arg(long, env = "PROXY_USERNAME")]
    pub username: Option<String>,

    /// Password for proxy basic authentication.
    #[arg(long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Cancel the connect if the tunnel is not up after this many milliseconds.
    #[arg(long, env = "PROXY_CONNECT_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Local address to bind the outgoing socket to.
    #[arg(long)]
    pub local_address: Option<SocketAddr>,

    /// Path to a TOML configuration file.
    #[arg(long, env = "PROXY_CONNECT_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

impl ConnectArgs {
    /// Merges the command line over the configuration file, if any.
    pub fn build(&self) -> anyhow::Result<ProxyConfig> {
        let file = match &self.config {
            Some(path) => ConfigFile::read(path)?,
            None => ConfigFile::default(),
        };
        let proxy_address = self
            .proxy
            .clone()
            .or(file.proxy_address)
            .context("no proxy address given, use --proxy or `proxy-address` in the config file")?;
        let credentials = match &self.username {
            Some(username) => Some(Credentials::new(
                username,
                self.password.clone().unwrap_or_default(),
            )),
            None => file.credentials,
        };
        let connect_timeout = self
            .timeout_ms
            .or(file.connect_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        Ok(ProxyConfig {
            proxy_address,
            credentials,
            connect_timeout,
        })
    }
}

/// On-disk configuration. Every entry can be overridden from the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default, deserialize_with = "deserialize_address")]
    pub proxy_address: Option<RemoteAddress>,
    pub credentials: Option<Credentials>,
    pub connect_timeout_ms: Option<u64>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        tracing::debug!(path = ?path, "Reading configuration file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing configuration file {}", path.display()))
    }
}

fn deserialize_address<'de, D>(deserializer: D) -> Result<Option<RemoteAddress>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| s.parse())
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub proxy_address: RemoteAddress,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    /// A fresh handshake engine for one connect attempt.
    pub fn handshake(&self) -> HttpConnectHandshake {
        let engine = HttpConnectHandshake::new(self.proxy_address.clone());
        match &self.credentials {
            Some(credentials) => engine.with_credentials(credentials.clone()),
            None => engine,
        }
    }
}

pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}
