//! Bidirectional byte copy between two established connections.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::dump::DumpSink;

pub const BUFFER_SIZE: usize = 8192;

/// Optional copies of each direction's bytes.
#[derive(Clone, Default)]
pub struct SpliceTaps {
    /// Bytes flowing from the first connection to the second.
    pub outbound: Option<DumpSink>,
    /// Bytes flowing from the second connection back to the first.
    pub inbound: Option<DumpSink>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub outbound: u64,
    pub inbound: u64,
}

/// Copies `a -> b` and `b -> a` until both directions are done.
///
/// End-of-stream on one side half-closes the other side's write direction
/// and lets the opposite direction keep flowing. A read or write error on
/// either leg stops both directions; both connections are closed on return.
pub async fn splice<A, B>(a: A, b: B, taps: &SpliceTaps) -> Transferred
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);
    let mut transferred = Transferred::default();

    let outcome = tokio::try_join!(
        pump(
            &mut a_reader,
            &mut b_writer,
            taps.outbound.clone(),
            &mut transferred.outbound,
        ),
        pump(
            &mut b_reader,
            &mut a_writer,
            taps.inbound.clone(),
            &mut transferred.inbound,
        ),
    );

    match outcome {
        Ok(_) => debug!(
            outbound_bytes = transferred.outbound,
            inbound_bytes = transferred.inbound,
            "Splice finished"
        ),
        Err(e) => debug!(
            error = %e,
            outbound_bytes = transferred.outbound,
            inbound_bytes = transferred.inbound,
            "Splice torn down"
        ),
    }
    transferred
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut tap: Option<DumpSink>,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }

        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;

        let tap_failure = match &tap {
            Some(sink) => sink.append(&buffer[..n]).err(),
            None => None,
        };
        if let Some(e) = tap_failure {
            warn!(error = %e, "Dump write failed, dropping tap for this connection");
            tap = None;
        }
    }
}
