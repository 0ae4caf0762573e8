use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::secure::SecureStream;

/// A tunnel connection, either raw TCP or wrapped in the secure pipe.
pub enum TunnelStream {
    Plain(TcpStream),
    Secure(Box<SecureStream<TcpStream>>),
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStream::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            TunnelStream::Secure(_) => f.debug_tuple("Secure").finish_non_exhaustive(),
        }
    }
}

macro_rules! each_variant {
    ($this:expr, $stream:ident => $call:expr) => {
        match &mut *$this {
            TunnelStream::Plain($stream) => $call,
            TunnelStream::Secure($stream) => $call,
        }
    };
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        each_variant!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        each_variant!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        each_variant!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        each_variant!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

impl TunnelStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Plain(tcp) => tcp.peer_addr(),
            Self::Secure(pipe) => pipe.get_ref().peer_addr(),
        }
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Secure(_))
    }
}
