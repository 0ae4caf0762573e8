//! Client side of the tunnel.
//!
//! Every accepted local connection gets its own relay connection, prefixed
//! with the destination frame for the configured remote, and is then spliced
//! through unchanged.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::{debug, error, info, warn};

use crate::codec::encode_destination;
use crate::config::ClientConfig;
use crate::dump::DumpSink;
use crate::probe::probe;
use crate::splice::{SpliceTaps, Transferred, splice};
use crate::transport::{ACCEPT_ERROR_BACKOFF, Transport, TunnelListener};

/// Everything a local connection handler needs, fixed at startup.
pub struct ClientContext {
    pub transport: Transport,
    pub relay: String,
    pub remote: String,
    header: Vec<u8>,
    pub taps: SpliceTaps,
}

impl ClientContext {
    pub fn new(transport: Transport, relay: String, remote: String, taps: SpliceTaps) -> Self {
        let header = encode_destination(&remote);
        Self {
            transport,
            relay,
            remote,
            header,
            taps,
        }
    }

    /// Builds the context from configuration, opening any dump files.
    pub async fn from_config(config: &ClientConfig) -> Result<Self> {
        let taps = SpliceTaps {
            outbound: match &config.dump_out {
                Some(path) => Some(DumpSink::open(path).await?),
                None => None,
            },
            inbound: match &config.dump_in {
                Some(path) => Some(DumpSink::open(path).await?),
                None => None,
            },
        };
        Ok(Self::new(
            config.transport(),
            config.relay.clone(),
            config.remote.clone(),
            taps,
        ))
    }
}

/// Probes the relay, binds the local port and serves until the listener fails.
pub async fn run(config: ClientConfig) -> Result<()> {
    let ctx = ClientContext::from_config(&config).await?;
    if ctx.transport.is_secure() {
        info!("Secure connection");
    }

    probe(&ctx.transport, &ctx.relay, config.probe_timeout)
        .await
        .context("Failed to probe relay")?;

    let listener = TunnelListener::bind(config.listen, config.keepalive)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    info!(
        listen_addr = %config.listen,
        relay = %ctx.relay,
        remote = %ctx.remote,
        "Client listening"
    );

    serve(listener, Arc::new(ctx)).await;
    Ok(())
}

/// Accept loop for local connections. Accept failures are logged and skipped.
pub async fn serve(listener: TunnelListener, ctx: Arc<ClientContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &ctx).await {
                        error!(client_addr = %addr, error = %format!("{e:#}"), "Connection failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

#[tracing::instrument(skip(local, ctx), fields(client_addr = %local.peer_addr().map_or_else(|_| "unknown".to_string(), |a| a.to_string())))]
pub async fn handle_connection(local: TcpStream, ctx: &ClientContext) -> Result<Transferred> {
    debug!(relay = %ctx.relay, "Dialing relay");
    let mut relay = ctx
        .transport
        .dial(&ctx.relay)
        .await
        .with_context(|| format!("Failed to dial relay {}", ctx.relay))?;
    if let Ok(relay_addr) = relay.peer_addr() {
        debug!(relay_addr = %relay_addr, secure = relay.is_secure(), "Relay connected");
    }

    relay
        .write_all(&ctx.header)
        .await
        .context("Failed to write destination header")?;
    relay
        .flush()
        .await
        .context("Failed to write destination header")?;
    debug!(remote = %ctx.remote, "Destination header sent");

    let transferred = splice(local, relay, &ctx.taps).await;
    info!(
        outbound_bytes = transferred.outbound,
        inbound_bytes = transferred.inbound,
        "Tunnel connection closed"
    );
    Ok(transferred)
}
