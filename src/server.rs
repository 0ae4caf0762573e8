//! Relay side of the tunnel.
//!
//! Each tunnel connection starts with a destination frame. A probe frame is
//! answered and closed; any other address is dialed and spliced to the
//! tunnel connection.

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::codec::{PROBE_ACK, is_probe, read_destination_within};
use crate::config::ServerConfig;
use crate::splice::{SpliceTaps, Transferred, splice};
use crate::transport::{ACCEPT_ERROR_BACKOFF, Transport, TunnelListener, connect_tcp};

/// Settings shared read-only by all tunnel connection handlers.
pub struct ServerContext {
    pub transport: Transport,
    pub header_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub max_address_len: usize,
}

impl ServerContext {
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            transport: config.transport(),
            header_timeout: config.header_timeout,
            connect_timeout: config.connect_timeout,
            keepalive: config.keepalive,
            max_address_len: config.max_address_len,
        }
    }
}

/// How a tunnel connection ended up being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ProbeAnswered,
    Spliced(Transferred),
}

/// A running relay. `start` and `stop` are the service lifecycle hooks.
pub struct RelayServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
}

impl RelayServer {
    /// Binds the listener and starts accepting in the background.
    pub async fn start(config: &ServerConfig) -> Result<Self> {
        let ctx = Arc::new(ServerContext::from_config(config));
        let listener = ctx
            .transport
            .listen(config.listen)
            .await
            .with_context(|| format!("Failed to bind to address {}", config.listen))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get relay listener local address")?;

        if ctx.transport.is_secure() {
            info!("Secure connection");
        }
        info!(listen_addr = %local_addr, "Relay listening");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_loop = tokio::spawn(serve(listener, ctx, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown,
            accept_loop,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new tunnel connections. Connections already being
    /// spliced run to completion on their own.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.accept_loop
            .await
            .context("Relay accept loop terminated abnormally")?;
        info!(listen_addr = %self.local_addr, "Relay stopped");
        Ok(())
    }
}

/// Runs the relay until Ctrl-C, then stops it.
pub async fn run(config: ServerConfig) -> Result<()> {
    let relay = RelayServer::start(&config).await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown requested");
    relay.stop().await
}

async fn serve(
    listener: TunnelListener,
    ctx: Arc<ServerContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, &ctx).await {
                            warn!(client_addr = %addr, error = %format!("{e:#}"), "Tunnel connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

#[tracing::instrument(skip(tcp, ctx))]
pub async fn handle_connection(
    tcp: TcpStream,
    client_addr: SocketAddr,
    ctx: &ServerContext,
) -> Result<Outcome> {
    info!("Accepted tunnel connection");

    // One deadline covers the secure handshake and the header; none applies afterwards.
    let deadline = Instant::now() + ctx.header_timeout;
    let mut tunnel = tokio::time::timeout_at(deadline, ctx.transport.upgrade_inbound(tcp))
        .await
        .with_context(|| format!("No secure handshake within {:?}", ctx.header_timeout))?
        .context("Secure handshake failed")?;
    let address = read_destination_within(
        &mut tunnel,
        ctx.max_address_len,
        deadline.saturating_duration_since(Instant::now()),
    )
    .await
    .context("Failed to read destination header")?;

    if is_probe(&address) {
        info!("Got probe");
        tunnel
            .write_all(PROBE_ACK)
            .await
            .context("Failed to write probe reply")?;
        tunnel
            .shutdown()
            .await
            .context("Failed to write probe reply")?;
        info!("Sent probe reply");
        return Ok(Outcome::ProbeAnswered);
    }

    debug!(target_addr = %address, "Attempting to connect to destination");
    let destination = connect_tcp(&address, ctx.connect_timeout, ctx.keepalive)
        .await
        .with_context(|| format!("Failed to dial {address}"))?;
    info!(target_addr = %address, "Connected to destination");

    let transferred = splice(tunnel, destination, &SpliceTaps::default()).await;
    info!(
        target_addr = %address,
        outbound_bytes = transferred.outbound,
        inbound_bytes = transferred.inbound,
        "Tunnel connection closed"
    );
    Ok(Outcome::Spliced(transferred))
}
