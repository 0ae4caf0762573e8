use anyhow::{Context, Result};
use std::{io, path::Path};
use tokio::{
    fs::OpenOptions,
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
};
use tracing::warn;

/// Chunks a sink holds for its writer before taps start losing data.
pub const DUMP_QUEUE_DEPTH: usize = 256;

/// Append-only file receiving a copy of relayed bytes.
///
/// Clones feed one writer task that owns the file, so chunks from concurrent
/// connections never interleave and a slow file never blocks a copy loop.
#[derive(Clone)]
pub struct DumpSink {
    chunks: mpsc::Sender<Vec<u8>>,
}

impl DumpSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open dump file {}", path.display()))?;
        Ok(Self::with_writer(file, DUMP_QUEUE_DEPTH))
    }

    pub(crate) fn with_writer<W>(mut writer: W, depth: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (chunks, mut pending) = mpsc::channel::<Vec<u8>>(depth);
        tokio::spawn(async move {
            while let Some(chunk) = pending.recv().await {
                if let Err(e) = write_chunk(&mut writer, &chunk).await {
                    warn!(error = %e, "Dump writer failed, discarding further chunks");
                    break;
                }
            }
        });
        Self { chunks }
    }

    /// Queues a copy of `bytes` without waiting on the file.
    ///
    /// Fails with `WouldBlock` while the writer is behind and with
    /// `BrokenPipe` once it has stopped.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        self.chunks.try_send(bytes.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "dump writer is behind")
            }
            TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "dump writer stopped")
            }
        })
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// Reads `path` once at least `len` bytes have landed in it.
#[cfg(test)]
pub(crate) async fn read_settled(path: &Path, len: usize) -> Vec<u8> {
    let settle = async {
        loop {
            let contents = tokio::fs::read(path).await.unwrap_or_default();
            if contents.len() >= len {
                return contents;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(2), settle)
        .await
        .expect("dump file never reached the expected length")
}
