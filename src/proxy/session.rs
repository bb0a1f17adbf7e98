//! Client session handling for intercepted TCP connections
//!
//! Each accepted client connection is read once, classified by its request
//! head, and bridged to the matching upgrade listener: CONNECT bursts go to
//! the TLS listener with only their post-header bytes forwarded, anything
//! else goes verbatim to the plain listener. After the bridge is up the
//! session is a transparent byte relay in both directions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::error::{CarouselError, Result};
use crate::proxy::pipe::{self, PipeEnd, RELAY_BUF_SIZE};

pub(crate) const CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub(crate) const CONNECT_ERROR: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Loopback addresses of the two upgrade listeners
#[derive(Debug, Clone, Copy)]
pub struct UpgradeTargets {
    pub plain: SocketAddr,
    pub tls: SocketAddr,
}

/// One intercepted client connection
pub struct Session {
    client: TcpStream,
    peer: SocketAddr,
    targets: UpgradeTargets,
}

impl Session {
    pub fn new(client: TcpStream, peer: SocketAddr, targets: UpgradeTargets) -> Self {
        Self {
            client,
            peer,
            targets,
        }
    }

    /// Drive the session to completion
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn run(mut self) {
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        let n = match self.client.read(&mut buf).await {
            Ok(0) => {
                debug!("Client closed before sending a request");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Failed to read initial burst: {}", e);
                return;
            }
        };
        let burst = &buf[..n];

        let head = match parse_burst(burst) {
            Ok(head) => head,
            Err(e) => {
                error!("Unparseable request: {}", e);
                return;
            }
        };
        debug!(method = %head.method, host = %head.host, "Classified client burst");

        let target = if head.tunnel {
            self.targets.tls
        } else {
            self.targets.plain
        };
        let mut backend = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target, host = %head.host, "Upgrade dial failed: {}", e);
                if head.tunnel {
                    let _ = self.client.write_all(CONNECT_ERROR).await;
                }
                return;
            }
        };

        // CONNECT heads are consumed here; the upgrade listener only sees
        // whatever the client pipelined after them
        let initial = if head.tunnel {
            match header_end(burst) {
                Some(end) => &burst[end..],
                None => {
                    warn!(host = %head.host, "CONNECT burst has no header terminator");
                    let _ = self.client.write_all(CONNECT_ERROR).await;
                    return;
                }
            }
        } else {
            burst
        };
        if let Err(e) = backend.write_all(initial).await {
            warn!(host = %head.host, "Failed to forward initial bytes: {}", e);
            if head.tunnel {
                let _ = self.client.write_all(CONNECT_ERROR).await;
            }
            return;
        }

        let (client_read, mut client_write) = self.client.into_split();
        let (backend_read, backend_write) = backend.into_split();

        let bytes_up = Arc::new(AtomicU64::new(0));
        let bytes_down = Arc::new(AtomicU64::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(2);

        let upstream = tokio::spawn(pipe::relay_stream(
            client_read,
            backend_write,
            bytes_up.clone(),
            done_tx.clone(),
        ));

        if head.tunnel {
            if let Err(e) = client_write.write_all(CONNECT_OK).await {
                debug!("Failed to acknowledge tunnel: {}", e);
                upstream.abort();
                return;
            }
        }

        let downstream = tokio::spawn(pipe::relay_stream(
            backend_read,
            client_write,
            bytes_down.clone(),
            done_tx,
        ));

        match done_rx.recv().await {
            Some(PipeEnd::Eof) => debug!(
                bytes_up = bytes_up.load(Ordering::Relaxed),
                bytes_down = bytes_down.load(Ordering::Relaxed),
                "Session closed"
            ),
            Some(PipeEnd::Failed(e)) => debug!(
                bytes_up = bytes_up.load(Ordering::Relaxed),
                bytes_down = bytes_down.load(Ordering::Relaxed),
                "Session failed: {}",
                e
            ),
            None => {}
        }
        upstream.abort();
        downstream.abort();
    }
}

/// Classified request head
#[derive(Debug, PartialEq, Eq)]
struct BurstHead {
    tunnel: bool,
    method: String,
    /// Target host, padded with `:80` when the client sent no port
    host: String,
}

/// Parse the request head, classify it, and normalize the target host
fn parse_burst(burst: &[u8]) -> Result<BurstHead> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(burst) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(CarouselError::RequestParse(
                "incomplete request head".to_string(),
            ))
        }
        Err(e) => return Err(CarouselError::RequestParse(e.to_string())),
    }

    let method = req.method.unwrap_or("").to_string();
    let tunnel = method == "CONNECT";

    let mut host = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned())
        .or_else(|| {
            // CONNECT carries the authority in the request line
            tunnel.then(|| req.path.unwrap_or("").to_string())
        })
        .unwrap_or_default();
    if !host.contains(':') {
        host.push_str(":80");
    }

    Ok(BurstHead {
        tunnel,
        method,
        host,
    })
}

/// Index just past the header terminator, if the burst has one
fn header_end(burst: &[u8]) -> Option<usize> {
    if let Some(pos) = find(burst, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    find(burst, b"\n\n").map(|pos| pos + 2)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (client, server_side, peer)
    }

    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn test_parse_burst() {
        let connect = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let head = parse_burst(connect).unwrap();
        assert!(head.tunnel);
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.host, "example.com:443");

        let get = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let head = parse_burst(get).unwrap();
        assert!(!head.tunnel);
        assert_eq!(head.method, "GET");
        assert_eq!(head.host, "example.com:80");

        assert!(parse_burst(b"GET / HTTP/1.1\r\nHost:").is_err());
        assert!(parse_burst(b"\xffgarbage").is_err());
    }

    #[test]
    fn test_parse_burst_host_from_connect_target() {
        let connect = b"CONNECT b.test:443 HTTP/1.1\r\n\r\n";
        let head = parse_burst(connect).unwrap();
        assert!(head.tunnel);
        assert_eq!(head.host, "b.test:443");
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"CONNECT x HTTP/1.1\r\n\r\nEXTRA"), Some(22));
        assert_eq!(header_end(b"CONNECT x HTTP/1.1\n\nEXTRA"), Some(20));
        assert_eq!(header_end(b"CONNECT x HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn test_relay_session_forwards_burst() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let (mut client, server_side, peer) = client_pair().await;
        let targets = UpgradeTargets {
            plain: backend_addr,
            tls: backend_addr,
        };
        let session = tokio::spawn(Session::new(server_side, peer, targets).run());

        let burst = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        client.write_all(burst).await.unwrap();

        let mut response = vec![0u8; 128];
        let n = client.read(&mut response).await.unwrap();
        assert!(response[..n].starts_with(b"HTTP/1.1 204"));

        // the plain upgrade sees the burst verbatim
        let seen = backend.await.unwrap();
        assert_eq!(seen.as_bytes(), burst);

        drop(client);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_session_forwards_post_header_bytes() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"EXTRA");
            stream.write_all(b"WORLD").await.unwrap();
        });

        let (mut client, server_side, peer) = client_pair().await;
        let targets = UpgradeTargets {
            plain: dead_addr().await,
            tls: backend_addr,
        };
        let session = tokio::spawn(Session::new(server_side, peer, targets).run());

        client
            .write_all(b"CONNECT b.test:443 HTTP/1.1\r\nHost: b.test:443\r\n\r\nEXTRA")
            .await
            .unwrap();

        // the acknowledgement comes from the session, not the backend
        let mut ack = vec![0u8; CONNECT_OK.len()];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_OK);

        let mut word = [0u8; 5];
        client.read_exact(&mut word).await.unwrap();
        assert_eq!(&word, b"WORLD");

        backend.await.unwrap();
        drop(client);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_dial_failure_reports_bad_gateway() {
        let dead = dead_addr().await;
        let (mut client, server_side, peer) = client_pair().await;
        let targets = UpgradeTargets {
            plain: dead,
            tls: dead,
        };
        let session = tokio::spawn(Session::new(server_side, peer, targets).run());

        client
            .write_all(b"CONNECT b.test:443 HTTP/1.1\r\nHost: b.test:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, CONNECT_ERROR);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_dial_failure_is_silent() {
        let dead = dead_addr().await;
        let (mut client, server_side, peer) = client_pair().await;
        let targets = UpgradeTargets {
            plain: dead,
            tls: dead,
        };
        let session = tokio::spawn(Session::new(server_side, peer, targets).run());

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_burst_drops_connection() {
        let dead = dead_addr().await;
        let (mut client, server_side, peer) = client_pair().await;
        let targets = UpgradeTargets {
            plain: dead,
            tls: dead,
        };
        let session = tokio::spawn(Session::new(server_side, peer, targets).run());

        client.write_all(b"\xffgarbage\r\n\r\n").await.unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        session.await.unwrap();
    }
}
