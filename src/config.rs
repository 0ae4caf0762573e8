use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::{
    fs, io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::codec::MAX_ADDRESS_LEN;
use crate::probe::DEFAULT_PROBE_TIMEOUT;
use crate::secure::SharedKey;
use crate::transport::{DEFAULT_CONNECT_TIMEOUT, Transport};

pub const DEFAULT_RELAY_PORT: u16 = 30541;
pub const DEFAULT_LOCAL_PORT: u16 = 5000;
pub const DEFAULT_RELAY_ADDR: &str = "localhost:30541";
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SERVER_KEEPALIVE: Duration = Duration::from_secs(30);

/// Name of the relay configuration file looked up next to the executable.
pub const SERVER_CONFIG_FILE: &str = "tps.config";

/// On-disk relay configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ServerFile {
    pub local_port: Option<u16>,
    pub key_file: Option<PathBuf>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub header_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub keepalive: Option<Duration>,
}

fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub key: Option<SharedKey>,
    /// Bound on the secure handshake plus the destination header.
    pub header_timeout: Duration,
    pub connect_timeout: Duration,
    /// Applied to accepted tunnel sockets and to destination sockets.
    pub keepalive: Option<Duration>,
    pub max_address_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            key: None,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: Some(DEFAULT_SERVER_KEEPALIVE),
            max_address_len: MAX_ADDRESS_LEN,
        }
    }
}

impl ServerConfig {
    pub fn from_file(file: ServerFile) -> Result<Self> {
        let mut config = Self::default();
        if let Some(port) = file.local_port {
            config.listen.set_port(port);
        }
        if let Some(path) = file.key_file.filter(|p| !p.as_os_str().is_empty()) {
            config.key = Some(load_key(&path)?);
        }
        if let Some(timeout) = file.header_timeout {
            config.header_timeout = timeout;
        }
        if let Some(timeout) = file.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(period) = file.keepalive {
            config.keepalive = non_zero(period);
        }
        Ok(config)
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::from_key(self.key.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_keepalive(self.keepalive)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub listen: SocketAddr,
    /// Address of the relay.
    pub relay: String,
    /// Destination every local connection is tunneled to.
    pub remote: String,
    pub key: Option<SharedKey>,
    pub dump_out: Option<PathBuf>,
    pub dump_in: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub keepalive: Option<Duration>,
}

impl ClientConfig {
    pub fn new(remote: impl Into<String>, relay: impl Into<String>) -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LOCAL_PORT)),
            relay: relay.into(),
            remote: remote.into(),
            key: None,
            dump_out: None,
            dump_in: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            keepalive: None,
        }
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::from_key(self.key.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_keepalive(self.keepalive)
    }
}

/// Reads the relay configuration file.
///
/// A missing file is not an error and yields `None`; a file that exists but
/// cannot be read or parsed is.
pub fn load_server_file(path: &Path) -> Result<Option<ServerFile>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read config file {}", path.display()));
        }
    };
    toml::from_str(&content)
        .map(Some)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    ServerConfig::from_file(load_server_file(path)?.unwrap_or_default())
}

/// `tps.config` in the directory holding the running executable.
pub fn default_server_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    let folder = exe.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok(folder.join(SERVER_CONFIG_FILE))
}

pub fn load_key(path: &Path) -> Result<SharedKey> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read key file {}", path.display()))?;
    SharedKey::new(bytes).with_context(|| format!("Key file {} is empty", path.display()))
}

pub(crate) fn non_zero(period: Duration) -> Option<Duration> {
    (!period.is_zero()).then_some(period)
}
