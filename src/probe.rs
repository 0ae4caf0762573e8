use anyhow::{Context, Result, bail};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use crate::codec::{PROBE_ACK, PROBE_ADDRESS, encode_destination};
use crate::transport::Transport;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_REPLY_LEN: usize = 30;

/// Checks that a relay is reachable and speaks the tunnel protocol.
///
/// Sends the probe frame and requires exactly [`PROBE_ACK`] in reply within
/// `deadline`. The TCP connect is bounded by the transport's connect timeout;
/// the secure handshake, if any, counts against `deadline`.
pub async fn probe(transport: &Transport, relay: &str, deadline: Duration) -> Result<()> {
    let tcp = transport
        .connect(relay)
        .await
        .with_context(|| format!("Failed to dial relay {relay}"))?;

    let exchange = async {
        let mut stream = transport
            .upgrade_outbound(tcp)
            .await
            .context("Secure handshake with relay failed")?;
        stream
            .write_all(&encode_destination(PROBE_ADDRESS))
            .await
            .context("Failed to write probe frame")?;
        stream.flush().await.context("Failed to write probe frame")?;
        info!(relay = %relay, "Sent probe");

        let mut reply = [0u8; MAX_REPLY_LEN];
        let mut filled = 0;
        while filled < PROBE_ACK.len() {
            let n = stream
                .read(&mut reply[filled..])
                .await
                .context("Failed to read probe reply")?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        anyhow::Ok(reply[..filled].to_vec())
    };

    let reply = tokio::time::timeout(deadline, exchange)
        .await
        .with_context(|| format!("Relay {relay} did not answer the probe within {deadline:?}"))??;

    if reply != PROBE_ACK {
        bail!(
            "Invalid probe reply from {relay}: {:?}",
            String::from_utf8_lossy(&reply)
        );
    }
    info!(relay = %relay, "Got probe reply");
    Ok(())
}
