use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::config::{
    ClientConfig, DEFAULT_LOCAL_PORT, DEFAULT_RELAY_ADDR, ServerConfig, default_server_config_path,
    load_key, load_server_config, load_server_file, non_zero,
};

#[derive(Debug, Parser)]
#[command(name = "tcp-tunnel", version, about = "Tunnel local TCP connections through a relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept local connections and tunnel them to a fixed remote address
    Client(ClientArgs),
    /// Accept tunnel connections and forward them to their destinations
    Server(ServerArgs),
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// Remote address to dial through the relay
    #[arg(long, value_name = "HOST:PORT", value_parser = non_empty)]
    pub remote: String,

    /// Local port to listen on
    #[arg(long, default_value_t = DEFAULT_LOCAL_PORT)]
    pub local: u16,

    /// Address of the relay server
    #[arg(long, value_name = "HOST:PORT", default_value = DEFAULT_RELAY_ADDR, value_parser = non_empty)]
    pub tcs: String,

    /// Shared key file; enables the secure connection
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// File to append out-bound traffic to
    #[arg(long, value_name = "PATH")]
    pub dump_out: Option<PathBuf>,

    /// File to append in-bound traffic to
    #[arg(long, value_name = "PATH")]
    pub dump_in: Option<PathBuf>,

    /// Timeout for dialing the relay
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Deadline for the startup probe reply
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    pub probe_timeout: Duration,

    /// TCP keepalive period for local and relay sockets
    #[arg(long, value_parser = humantime::parse_duration)]
    pub keepalive: Option<Duration>,
}

impl ClientArgs {
    pub fn into_config(self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(self.remote, self.tcs);
        config.listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.local));
        config.key = self.key.as_deref().map(load_key).transpose()?;
        config.dump_out = self.dump_out;
        config.dump_in = self.dump_in;
        config.connect_timeout = self.connect_timeout;
        config.probe_timeout = self.probe_timeout;
        config.keepalive = self.keepalive.and_then(non_zero);
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Configuration file; defaults to tps.config next to the executable
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    /// An explicitly named file must exist; the default one is optional.
    pub fn load_config(&self) -> Result<ServerConfig> {
        match &self.config {
            Some(path) => {
                let file = load_server_file(path)?
                    .with_context(|| format!("Config file {} not found", path.display()))?;
                ServerConfig::from_file(file)
            }
            None => load_server_config(&default_server_config_path()?),
        }
    }
}

fn non_empty(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        Err("must not be empty".to_string())
    } else {
        Ok(value.to_string())
    }
}
