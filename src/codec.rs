//! Tunnel header framing.
//!
//! The first bytes on every tunnel connection are a destination frame: a
//! little-endian `u32` length followed by that many bytes of `host:port`.
//! A frame carrying [`PROBE_ADDRESS`] is a liveness probe, answered with the
//! raw [`PROBE_ACK`] bytes.

use std::{io, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reserved destination used by the client startup check.
pub const PROBE_ADDRESS: &str = "$$PING$$";

/// Reply to a probe frame. Sent as-is, without a length prefix.
pub const PROBE_ACK: &[u8] = b"$$PONG$$";

/// Default upper bound on the address length accepted from a peer.
pub const MAX_ADDRESS_LEN: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("destination length {len} exceeds the limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("stream ended before the destination frame was complete")]
    ShortRead,
    #[error("destination address is not valid UTF-8")]
    InvalidAddress,
    #[error("no destination frame within {0:?}")]
    Timeout(Duration),
    #[error("failed to read destination frame")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::ShortRead
        } else {
            Self::Io(err)
        }
    }
}

/// Builds the destination frame for `address`.
#[must_use]
pub fn encode_destination(address: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + address.len());
    frame.extend_from_slice(&(address.len() as u32).to_le_bytes());
    frame.extend_from_slice(address.as_bytes());
    frame
}

/// Reads one destination frame. The declared length is checked against
/// `max_len` before the body is allocated or read.
pub async fn read_destination<R>(reader: &mut R, max_len: usize) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix).await?;

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut address = vec![0u8; len];
    reader.read_exact(&mut address).await?;
    String::from_utf8(address).map_err(|_| FrameError::InvalidAddress)
}

/// Same as [`read_destination`], but gives up after `deadline`.
pub async fn read_destination_within<R>(
    reader: &mut R,
    max_len: usize,
    deadline: Duration,
) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, read_destination(reader, max_len))
        .await
        .map_err(|_| FrameError::Timeout(deadline))?
}

#[must_use]
pub fn is_probe(address: &str) -> bool {
    address == PROBE_ADDRESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    #[test]
    fn encodes_length_prefix_little_endian() {
        let frame = encode_destination("example.org:80");
        assert_eq!(frame[..4], [14u8, 0, 0, 0]);
        assert_eq!(&frame[4..], b"example.org:80");
    }

    #[test]
    fn probe_frame_is_eight_byte_payload() {
        let frame = encode_destination(PROBE_ADDRESS);
        assert_eq!(frame, b"\x08\x00\x00\x00$$PING$$");
        assert!(is_probe(PROBE_ADDRESS));
        assert!(!is_probe("$$PING$$ "));
    }

    #[tokio::test]
    async fn decodes_what_was_encoded() {
        for address in ["", "127.0.0.1:22", "[::1]:8080", "bücher.example:443"] {
            let frame = encode_destination(address);
            let decoded = read_destination(&mut frame.as_slice(), MAX_ADDRESS_LEN)
                .await
                .unwrap();
            assert_eq!(decoded, address);
        }
    }

    #[tokio::test]
    async fn leaves_trailing_bytes_unread() {
        let mut wire = encode_destination("db:5432");
        wire.extend_from_slice(b"payload");
        let mut reader = wire.as_slice();

        let decoded = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap();
        assert_eq!(decoded, "db:5432");
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn handles_fragmented_delivery() {
        let mut reader = Builder::new()
            .read(&[9, 0])
            .read(&[0, 0, b'l', b'o'])
            .read(b"cal:5000")
            .build();

        let decoded = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap();
        assert_eq!(decoded, "local:5000");
    }

    #[tokio::test]
    async fn rejects_oversized_frame_without_reading_body() {
        // Only the prefix is scripted; reading further would surface as ShortRead.
        let mut reader = Builder::new().read(&[0x01, 0x00, 0x01, 0x00]).build();

        let err = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::TooLarge { len: 65537, max: MAX_ADDRESS_LEN }
        ));
    }

    #[tokio::test]
    async fn accepts_frame_at_exact_limit() {
        let frame = encode_destination("abcd");
        let decoded = read_destination(&mut frame.as_slice(), 4).await.unwrap();
        assert_eq!(decoded, "abcd");
    }

    #[tokio::test]
    async fn short_prefix_is_short_read() {
        let mut reader = Builder::new().read(&[5, 0]).build();

        let err = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead));
    }

    #[tokio::test]
    async fn truncated_body_is_short_read() {
        let mut reader = Builder::new().read(&[10, 0, 0, 0]).read(b"host").build();

        let err = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead));
    }

    #[tokio::test]
    async fn rejects_invalid_utf8() {
        let mut reader = Builder::new().read(&[2, 0, 0, 0, 0xff, 0xfe]).build();

        let err = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidAddress));
    }

    #[tokio::test]
    async fn io_errors_are_kept() {
        let mut reader = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let err = read_destination(&mut reader, MAX_ADDRESS_LEN).await.unwrap_err();
        match err {
            FrameError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_applies_only_when_requested() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&[7, 0, 0, 0, b'x']).await.unwrap();

        let err = read_destination_within(&mut reader, MAX_ADDRESS_LEN, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout(_)));
    }

    #[tokio::test]
    async fn deadline_allows_prompt_frames() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer
            .write_all(&encode_destination("10.0.0.1:3389"))
            .await
            .unwrap();

        let decoded = read_destination_within(&mut reader, MAX_ADDRESS_LEN, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(decoded, "10.0.0.1:3389");
    }
}
