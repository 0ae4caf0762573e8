//! TCP tunnel
//!
//! A client accepts local TCP connections and forwards each one through a
//! relay to a fixed remote address. The relay reads a length-prefixed
//! destination header from every tunnel connection, dials that destination
//! and splices the two connections. The client-relay hop can run over a
//! pre-shared-key secure pipe instead of raw TCP.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod dump;
pub mod logging;
pub mod probe;
pub mod secure;
pub mod server;
pub mod splice;
pub mod stream;
pub mod transport;

// Re-export commonly used types and functions
pub use client::ClientContext;
pub use codec::{FrameError, PROBE_ACK, PROBE_ADDRESS, encode_destination, read_destination};
pub use config::{ClientConfig, ServerConfig, load_key, load_server_config};
pub use dump::DumpSink;
pub use probe::probe;
pub use secure::SharedKey;
pub use server::RelayServer;
pub use splice::{BUFFER_SIZE, SpliceTaps, Transferred, splice};
pub use stream::TunnelStream;
pub use transport::{Transport, TunnelListener};

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::{net::SocketAddr, sync::Arc, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(3);

    async fn start_relay(key: Option<SharedKey>) -> (RelayServer, String) {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            key,
            keepalive: None,
            ..ServerConfig::default()
        };
        let relay = RelayServer::start(&config).await.unwrap();
        let addr = relay.local_addr().to_string();
        (relay, addr)
    }

    /// Starts a client for `remote` on an ephemeral local port, probing first like `client::run`.
    async fn start_client(relay: &str, remote: &str, key: Option<SharedKey>) -> SocketAddr {
        let mut config = ClientConfig::new(remote, relay);
        config.key = key;
        let ctx = ClientContext::from_config(&config).await.unwrap();
        probe(&ctx.transport, &ctx.relay, config.probe_timeout)
            .await
            .unwrap();

        let listener = TunnelListener::bind("127.0.0.1:0", None).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(client::serve(listener, Arc::new(ctx)));
        addr
    }

    /// Echo server that prefixes every reply with `tag`.
    async fn start_tagged_echo(tag: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let mut reply = tag.to_vec();
                                reply.extend_from_slice(&buffer[..n]);
                                if stream.write_all(&reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn round_trip(client_addr: SocketAddr, payload: &[u8], expected_len: usize) -> Vec<u8> {
        let mut local = TcpStream::connect(client_addr).await.unwrap();
        local.write_all(payload).await.unwrap();
        let mut reply = vec![0u8; expected_len];
        timeout(TEST_TIMEOUT, local.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    mod end_to_end {
        use super::*;

        #[tokio::test]
        async fn plain_tunnel_carries_bytes_both_ways() {
            let destination = start_tagged_echo(b"echo:").await;
            let (_relay, relay_addr) = start_relay(None).await;
            let client_addr = start_client(&relay_addr, &destination, None).await;

            let reply = round_trip(client_addr, b"hello", 10).await;
            assert_eq!(reply, b"echo:hello");
        }

        #[tokio::test]
        async fn secure_tunnel_carries_bytes_both_ways() {
            let key = SharedKey::new(b"end-to-end secret".to_vec()).unwrap();
            let destination = start_tagged_echo(b"echo:").await;
            let (_relay, relay_addr) = start_relay(Some(key.clone())).await;
            let client_addr = start_client(&relay_addr, &destination, Some(key)).await;

            let payload = vec![0x5a; 100_000];
            let local = TcpStream::connect(client_addr).await.unwrap();
            let (mut reader, mut writer) = local.into_split();
            let sent = payload.len();
            tokio::spawn(async move {
                writer.write_all(&payload).await.unwrap();
            });

            // The echo server may reply in several chunks, each prefixed.
            let mut echoed = 0;
            let mut buffer = vec![0u8; 8192];
            while echoed < sent {
                let n = timeout(TEST_TIMEOUT, reader.read(&mut buffer))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "tunnel closed early");
                echoed += buffer[..n].iter().filter(|&&b| b == 0x5a).count();
            }
            assert_eq!(echoed, sent);
        }

        #[tokio::test]
        async fn local_close_reaches_destination() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let destination = listener.local_addr().unwrap().to_string();
            let (_relay, relay_addr) = start_relay(None).await;
            let client_addr = start_client(&relay_addr, &destination, None).await;

            let mut local = TcpStream::connect(client_addr).await.unwrap();
            local.write_all(b"PAYLOAD-1").await.unwrap();
            let (mut remote, _) = timeout(TEST_TIMEOUT, listener.accept())
                .await
                .unwrap()
                .unwrap();
            let mut received = [0u8; 9];
            remote.read_exact(&mut received).await.unwrap();
            assert_eq!(&received, b"PAYLOAD-1");

            drop(local);
            let mut rest = Vec::new();
            timeout(TEST_TIMEOUT, remote.read_to_end(&mut rest))
                .await
                .unwrap()
                .unwrap();
            assert!(rest.is_empty());
        }

        #[tokio::test]
        async fn concurrent_tunnels_do_not_cross() {
            let destination_a = start_tagged_echo(b"A:").await;
            let destination_b = start_tagged_echo(b"B:").await;
            let (_relay, relay_addr) = start_relay(None).await;
            let client_a = start_client(&relay_addr, &destination_a, None).await;
            let client_b = start_client(&relay_addr, &destination_b, None).await;

            let replies = join_all([
                round_trip(client_a, b"AAA", 5),
                round_trip(client_b, b"BBB", 5),
                round_trip(client_a, b"AAA", 5),
                round_trip(client_b, b"BBB", 5),
            ])
            .await;

            assert_eq!(replies[0], b"A:AAA");
            assert_eq!(replies[1], b"B:BBB");
            assert_eq!(replies[2], b"A:AAA");
            assert_eq!(replies[3], b"B:BBB");
        }

        #[tokio::test]
        async fn refused_destination_closes_local_without_data() {
            let (_relay, relay_addr) = start_relay(None).await;
            let client_addr = start_client(&relay_addr, "127.0.0.1:1", None).await;

            let mut local = TcpStream::connect(client_addr).await.unwrap();
            let mut received = Vec::new();
            let read = timeout(TEST_TIMEOUT, local.read_to_end(&mut received))
                .await
                .unwrap();
            assert!(read.map_or(true, |n| n == 0));
            assert!(received.is_empty());
        }
    }

    mod startup {
        use super::*;

        #[tokio::test]
        async fn client_refuses_to_start_without_relay() {
            let relay = {
                let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
                gone.local_addr().unwrap().to_string()
            };
            let mut config = ClientConfig::new("example.org:80", relay);
            config.listen = "127.0.0.1:0".parse().unwrap();

            let err = timeout(TEST_TIMEOUT, client::run(config))
                .await
                .unwrap()
                .unwrap_err();
            assert!(err.to_string().contains("Failed to probe relay"));
        }

        #[tokio::test]
        async fn client_refuses_to_start_with_wrong_key() {
            let relay_key = SharedKey::new(b"relay".to_vec()).unwrap();
            let (_relay, relay_addr) = start_relay(Some(relay_key)).await;
            let mut config = ClientConfig::new("example.org:80", relay_addr);
            config.listen = "127.0.0.1:0".parse().unwrap();
            config.key = Some(SharedKey::new(b"client".to_vec()).unwrap());

            let result = timeout(TEST_TIMEOUT, client::run(config)).await.unwrap();
            assert!(result.is_err());
        }
    }
}
