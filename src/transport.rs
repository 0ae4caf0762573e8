//! Connection factory for the tunnel hop.
//!
//! [`Transport`] hides whether the client-relay link is raw TCP or the
//! pre-shared-key secure pipe. Listening stays plain TCP: the secure handshake
//! for an accepted socket runs in that connection's own task through
//! [`Transport::upgrade_inbound`], so the accept loop never waits on a peer.

use socket2::{SockRef, TcpKeepalive};
use std::{io, net::SocketAddr, time::Duration};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::secure::{self, SharedKey};
use crate::stream::TunnelStream;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` so a persistent error does not spin the loop.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub enum Security {
    Plain,
    Secure(SharedKey),
}

#[derive(Clone, Debug)]
pub struct Transport {
    security: Security,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl Transport {
    #[must_use]
    pub fn plain() -> Self {
        Self::new(Security::Plain)
    }

    #[must_use]
    pub fn secure(key: SharedKey) -> Self {
        Self::new(Security::Secure(key))
    }

    /// Secure when a key is configured, plain otherwise.
    #[must_use]
    pub fn from_key(key: Option<SharedKey>) -> Self {
        key.map_or_else(Self::plain, Self::secure)
    }

    fn new(security: Security) -> Self {
        Self {
            security,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: None,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self.security, Security::Secure(_))
    }

    /// Opens the TCP connection only; pair with [`Transport::upgrade_outbound`].
    pub async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        connect_tcp(address, self.connect_timeout, self.keepalive).await
    }

    /// Connects and runs the secure handshake, both within the connect timeout.
    pub async fn dial(&self, address: &str) -> io::Result<TunnelStream> {
        let dial = async {
            let tcp = self.connect(address).await?;
            self.upgrade_outbound(tcp).await
        };
        tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| timed_out(address, self.connect_timeout))?
    }

    pub async fn listen<A: ToSocketAddrs>(&self, address: A) -> io::Result<TunnelListener> {
        TunnelListener::bind(address, self.keepalive).await
    }

    pub async fn upgrade_outbound(&self, tcp: TcpStream) -> io::Result<TunnelStream> {
        match &self.security {
            Security::Plain => Ok(TunnelStream::Plain(tcp)),
            Security::Secure(key) => Ok(TunnelStream::Secure(Box::new(
                secure::connect(tcp, key).await?,
            ))),
        }
    }

    pub async fn upgrade_inbound(&self, tcp: TcpStream) -> io::Result<TunnelStream> {
        match &self.security {
            Security::Plain => Ok(TunnelStream::Plain(tcp)),
            Security::Secure(key) => Ok(TunnelStream::Secure(Box::new(
                secure::accept(tcp, key).await?,
            ))),
        }
    }
}

/// A TCP listener that applies keepalive to every accepted socket.
pub struct TunnelListener {
    inner: TcpListener,
    keepalive: Option<Duration>,
}

impl TunnelListener {
    pub async fn bind<A: ToSocketAddrs>(address: A, keepalive: Option<Duration>) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(address).await?,
            keepalive,
        })
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        if let Some(period) = self.keepalive {
            set_keepalive(&stream, period)?;
        }
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Opens a TCP connection, failing with `TimedOut` once `timeout` elapses.
pub async fn connect_tcp(
    address: &str,
    timeout: Duration,
    keepalive: Option<Duration>,
) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| timed_out(address, timeout))??;
    if let Some(period) = keepalive {
        set_keepalive(&stream, period)?;
    }
    Ok(stream)
}

fn timed_out(address: &str, timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connect to {address} timed out after {timeout:?}"),
    )
}

pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
