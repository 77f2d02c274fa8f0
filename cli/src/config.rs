use std::{
    collections::BTreeMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use relaydrop_client::ClientConfig;
use relaydrop_relay::RelayConfig;
use relaydropx_common::{PortLayout, StaticResolver};
use serde::{Deserialize, Serialize};

/// Settings read from `config.toml`. Command-line flags take precedence.
///
/// Storage location:
/// - Linux: $XDG_CONFIG_HOME/relaydrop/config.toml or
///   $HOME/.config/relaydrop/config.toml
/// - macOS: $HOME/Library/Application Support/relaydrop/config.toml
/// - Windows: %APPDATA%\relaydrop\config.toml
///
/// ```toml
/// server_host = "relay-host"
/// roster_file = "/etc/relaydrop/roster.txt"
/// destination = "/home/ann/Downloads"
/// retry_interval_ms = 4000
///
/// [ports]
/// control_port = 9000
/// data_port = 9600
///
/// [hosts]
/// ann-pc = "192.168.1.20"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Relay contacted when a command names none.
    pub server_host: Option<String>,
    pub roster_file: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub host_name: Option<String>,
    pub bind_address: Option<IpAddr>,
    pub ports: PortLayout,
    pub retry_interval_ms: Option<u64>,
    pub chunk_size: Option<u64>,
    /// Static host name to address overrides.
    pub hosts: BTreeMap<String, IpAddr>,
}

impl CliConfig {
    /// Returns the configuration directory path under the user's
    /// platform-appropriate config directory.
    pub fn config_dir() -> Result<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            if let Ok(appdata) = env::var("APPDATA") {
                return Ok(PathBuf::from(appdata).join("relaydrop"));
            }
            if let Ok(userprofile) = env::var("USERPROFILE") {
                return Ok(PathBuf::from(userprofile)
                    .join(".config")
                    .join("relaydrop"));
            }
            return Err(anyhow!(
                "Unable to determine config directory (missing APPDATA/USERPROFILE)"
            ));
        }

        #[cfg(target_os = "macos")]
        {
            if let Ok(home) = env::var("HOME") {
                return Ok(PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("relaydrop"));
            }
            return Err(anyhow!(
                "Unable to determine config directory (missing HOME)"
            ));
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = if let Ok(xdg_config_home) =
                env::var("XDG_CONFIG_HOME")
            {
                PathBuf::from(xdg_config_home)
            } else if let Ok(home) = env::var("HOME") {
                PathBuf::from(home).join(".config")
            } else {
                return Err(anyhow!(
                    "Unable to determine config directory (missing XDG_CONFIG_HOME/HOME)"
                ));
            };
            Ok(config_dir.join("relaydrop"))
        }
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Reads `path`, or the default location when `None`. A missing default
    /// file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_file = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let config_file = Self::config_file()?;
                if !config_file.exists() {
                    return Ok(Self::default());
                }
                config_file
            }
        };

        let content = fs::read_to_string(&config_file).with_context(|| {
            format!("Failed to read config file: {}", config_file.display())
        })?;
        Self::parse(&content).with_context(|| {
            format!("Failed to parse config file: {}", config_file.display())
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_ms.map(Duration::from_millis)
    }

    pub fn resolver(&self) -> StaticResolver {
        self.hosts
            .iter()
            .map(|(host, ip)| (host.clone(), *ip))
            .collect()
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            ports: self.ports,
            bind_address: self.bind_address,
            ..ClientConfig::default()
        };
        if let Some(host_name) = &self.host_name {
            config.host_name = host_name.clone();
        }
        if let Some(destination) = &self.destination {
            config.destination = destination.clone();
        }
        if let Some(interval) = self.retry_interval() {
            config.retry_interval = interval;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.sender.chunk_size = chunk_size;
            config.receiver.chunk_size = chunk_size;
        }
        config
    }

    pub fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig {
            ports: self.ports,
            bind_address: self.bind_address,
            ..RelayConfig::default()
        };
        if let Some(staging_dir) = &self.staging_dir {
            config.staging_dir = staging_dir.clone();
        }
        if let Some(interval) = self.retry_interval() {
            config.retry_interval = interval;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.sender.chunk_size = chunk_size;
            config.receiver.chunk_size = chunk_size;
        }
        config
    }

    /// The relay to use: `server` if given, otherwise `server_host`.
    pub fn server(&self, server: Option<String>) -> Result<String> {
        server
            .or_else(|| self.server_host.clone())
            .ok_or_else(|| {
                anyhow!("No relay given and no server_host in the config file")
            })
    }
}
