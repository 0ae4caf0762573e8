//! Pre-shared-key secure pipe.
//!
//! Both ends prove knowledge of the same secret with an HMAC-SHA256 nonce
//! exchange, then derive one AES-256-GCM key per direction with HKDF. After
//! the handshake every write is sent as a length-prefixed sealed record whose
//! nonce is a per-direction counter.

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

type HmacSha256 = Hmac<Sha256>;

const HANDSHAKE_NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;
const TAG_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 8192;

/// Largest plaintext carried by one record.
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

/// Secret bytes shared out of band by the client and the relay.
#[derive(Clone)]
pub struct SharedKey(Arc<[u8]>);

impl SharedKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> io::Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared key must not be empty",
            ));
        }
        Ok(Self(bytes.into()))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// Runs the dialing side of the handshake over `stream`.
pub async fn connect<S>(mut stream: S, key: &SharedKey) -> io::Result<SecureStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut client_nonce);
    stream.write_all(&client_nonce).await?;
    stream.flush().await?;

    let mut server_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    stream.read_exact(&mut server_nonce).await?;
    let mut server_mac = [0u8; MAC_LEN];
    stream.read_exact(&mut server_mac).await?;
    transcript_mac(key, b"server", &client_nonce, &server_nonce)?
        .verify_slice(&server_mac)
        .map_err(|_| handshake_rejected())?;

    let client_mac = transcript_mac(key, b"client", &server_nonce, &client_nonce)?
        .finalize()
        .into_bytes();
    stream.write_all(&client_mac).await?;
    stream.flush().await?;

    let salt = [client_nonce, server_nonce].concat();
    Ok(SecureStream::new(
        stream,
        RecordCipher::derive(key, &salt, b"c2s")?,
        RecordCipher::derive(key, &salt, b"s2c")?,
    ))
}

/// Runs the accepting side of the handshake over `stream`.
pub async fn accept<S>(mut stream: S, key: &SharedKey) -> io::Result<SecureStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    stream.read_exact(&mut client_nonce).await?;

    let mut server_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut server_nonce);
    let server_mac = transcript_mac(key, b"server", &client_nonce, &server_nonce)?
        .finalize()
        .into_bytes();
    stream.write_all(&server_nonce).await?;
    stream.write_all(&server_mac).await?;
    stream.flush().await?;

    let mut client_mac = [0u8; MAC_LEN];
    stream.read_exact(&mut client_mac).await?;
    transcript_mac(key, b"client", &server_nonce, &client_nonce)?
        .verify_slice(&client_mac)
        .map_err(|_| handshake_rejected())?;

    let salt = [client_nonce, server_nonce].concat();
    Ok(SecureStream::new(
        stream,
        RecordCipher::derive(key, &salt, b"s2c")?,
        RecordCipher::derive(key, &salt, b"c2s")?,
    ))
}

fn transcript_mac(
    key: &SharedKey,
    label: &[u8],
    first: &[u8],
    second: &[u8],
) -> io::Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "unusable shared key"))?;
    mac.update(label);
    mac.update(first);
    mac.update(second);
    Ok(mac)
}

fn handshake_rejected() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "secure handshake failed: peer does not hold the shared key",
    )
}

struct RecordCipher {
    aead: Aes256Gcm,
    counter: u64,
}

impl RecordCipher {
    fn derive(key: &SharedKey, salt: &[u8], info: &[u8]) -> io::Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), key.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(info, &mut okm)
            .map_err(|_| io::Error::other("key expansion failed"))?;
        let aead = Aes256Gcm::new_from_slice(&okm)
            .map_err(|_| io::Error::other("invalid record key length"))?;
        Ok(Self { aead, counter: 0 })
    }

    fn next_nonce(&mut self) -> io::Result<[u8; 12]> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("record counter exhausted"))?;
        Ok(nonce)
    }

    fn seal(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| io::Error::other("failed to seal record"))
    }

    fn open(&mut self, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record authentication failed"))
    }
}

/// An established secure pipe over `S`.
pub struct SecureStream<S> {
    inner: S,
    sealer: RecordCipher,
    opener: RecordCipher,
    incoming: Vec<u8>,
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    read_eof: bool,
    outgoing: Vec<u8>,
    outgoing_pos: usize,
}

impl<S> SecureStream<S> {
    fn new(inner: S, sealer: RecordCipher, opener: RecordCipher) -> Self {
        Self {
            inner,
            sealer,
            opener,
            incoming: Vec::new(),
            plaintext: Vec::new(),
            plaintext_pos: 0,
            read_eof: false,
            outgoing: Vec::new(),
            outgoing_pos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Moves the next complete record from `incoming` into `plaintext`.
    fn open_buffered_record(&mut self) -> io::Result<bool> {
        if self.incoming.len() < RECORD_HEADER_LEN {
            return Ok(false);
        }
        let mut header = [0u8; RECORD_HEADER_LEN];
        header.copy_from_slice(&self.incoming[..RECORD_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if !(TAG_LEN..=MAX_RECORD_PAYLOAD + TAG_LEN).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid record length {len}"),
            ));
        }
        let end = RECORD_HEADER_LEN + len;
        if self.incoming.len() < end {
            return Ok(false);
        }

        self.plaintext = self.opener.open(&self.incoming[RECORD_HEADER_LEN..end])?;
        self.plaintext_pos = 0;
        self.incoming.drain(..end);
        Ok(true)
    }
}

impl<S: AsyncWrite + Unpin> SecureStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.outgoing_pos < self.outgoing.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.outgoing[self.outgoing_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outgoing_pos += n;
        }
        self.outgoing.clear();
        self.outgoing_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SecureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plaintext_pos < this.plaintext.len() {
                let available = &this.plaintext[this.plaintext_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.plaintext_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.open_buffered_record()? {
                continue;
            }

            if this.read_eof {
                if this.incoming.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a record",
                )));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.read_eof = true;
            } else {
                this.incoming.extend_from_slice(chunk_buf.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SecureStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_RECORD_PAYLOAD);
        let sealed = this.sealer.seal(&buf[..n])?;
        this.outgoing
            .extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        this.outgoing.extend_from_slice(&sealed);

        // The record is owned by `outgoing` now; a pending drain finishes on the next poll.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
