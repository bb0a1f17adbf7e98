//! Egress transport construction
//!
//! Builds one outbound connection per resolution attempt: through a SOCKS5
//! relay, through a credentialed HTTP proxy, or straight to the origin.
//! HTTPS targets are wrapped in a client TLS session once the raw stream is
//! established; plain HTTP through an upstream proxy keeps the proxy
//! connection itself and expects absolute-form requests.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{CarouselError, Result};
use crate::models::BackendClass;
use crate::proxy::tls;

/// Trait for egress connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl ProxyConnection for TcpStream {}
impl ProxyConnection for tokio_rustls::client::TlsStream<TcpStream> {}

/// An established egress connection plus the request shape it expects
pub struct EgressStream {
    pub stream: Box<dyn ProxyConnection>,
    /// Stream terminates at an upstream proxy; requests must use the
    /// absolute URI form
    pub proxied_plain: bool,
    /// Credentials to attach to absolute-form requests
    pub proxy_auth: Option<HeaderValue>,
}

impl std::fmt::Debug for EgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressStream")
            .field("proxied_plain", &self.proxied_plain)
            .finish_non_exhaustive()
    }
}

/// Dial strategy for a single resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// SOCKS5 relay, no authentication
    Relay { host: String, port: u16 },
    /// Upstream HTTP proxy with optional basic credentials
    HttpProxy {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    /// Straight TCP to the origin
    Direct,
}

impl TransportConfig {
    /// Build the dial strategy for a backend class and selected endpoint
    ///
    /// Relay endpoints arrive as `host:port`, proxy endpoints as
    /// `user:password@host:port`. Direct egress takes no endpoint and
    /// ignores one if present.
    pub fn build(class: BackendClass, endpoint: Option<&str>) -> Result<Self> {
        match class {
            BackendClass::Dynamic | BackendClass::Tor => {
                let endpoint = endpoint.ok_or_else(|| {
                    CarouselError::InvalidEndpoint("relay endpoint missing".to_string())
                })?;
                let (host, port) = parse_host_port(endpoint)?;
                Ok(TransportConfig::Relay { host, port })
            }
            BackendClass::Http => {
                let endpoint = endpoint.ok_or_else(|| {
                    CarouselError::InvalidEndpoint("proxy endpoint missing".to_string())
                })?;
                let url = Url::parse(&format!("http://{}", endpoint))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| {
                        CarouselError::InvalidEndpoint(format!("no host in {}", endpoint))
                    })?
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_string();
                let port = url.port().ok_or_else(|| {
                    CarouselError::InvalidEndpoint(format!("no port in {}", endpoint))
                })?;
                let username = match url.username() {
                    "" => None,
                    user => Some(user.to_string()),
                };
                let password = url.password().map(str::to_string);
                Ok(TransportConfig::HttpProxy {
                    host,
                    port,
                    username,
                    password,
                })
            }
            BackendClass::Direct => Ok(TransportConfig::Direct),
        }
    }

    /// Establish an egress connection to `host:port`
    #[instrument(skip(self), fields(target = %host, https))]
    pub async fn connect(&self, https: bool, host: &str, port: u16) -> Result<EgressStream> {
        match self {
            TransportConfig::Relay {
                host: relay_host,
                port: relay_port,
            } => {
                debug!("Connecting through relay at {}:{}", relay_host, relay_port);
                let stream = socks_dial(relay_host, *relay_port, host, port)
                    .await
                    .map_err(|e| CarouselError::TransportExecution(format!("{:#}", e)))?;
                finish(stream, https, host).await
            }
            TransportConfig::HttpProxy {
                host: proxy_host,
                port: proxy_port,
                username,
                password,
            } => {
                debug!("Connecting through proxy at {}:{}", proxy_host, proxy_port);
                let auth = basic_auth(username.as_deref(), password.as_deref());
                let mut stream = TcpStream::connect(format_tcp_addr(proxy_host, *proxy_port))
                    .await
                    .map_err(|e| {
                        CarouselError::TransportExecution(format!(
                            "failed to reach proxy {}:{}: {}",
                            proxy_host, proxy_port, e
                        ))
                    })?;
                if https {
                    establish_proxy_tunnel(&mut stream, host, port, auth.as_ref())
                        .await
                        .map_err(|e| CarouselError::TransportExecution(format!("{:#}", e)))?;
                    debug!("CONNECT tunnel established");
                    finish(stream, true, host).await
                } else {
                    Ok(EgressStream {
                        stream: Box::new(stream),
                        proxied_plain: true,
                        proxy_auth: auth,
                    })
                }
            }
            TransportConfig::Direct => {
                debug!("Connecting directly");
                let stream = TcpStream::connect(format_tcp_addr(host, port))
                    .await
                    .map_err(|e| {
                        CarouselError::TransportExecution(format!(
                            "failed to reach {}:{}: {}",
                            host, port, e
                        ))
                    })?;
                finish(stream, https, host).await
            }
        }
    }
}

/// Wrap the raw stream in TLS when the target is HTTPS
async fn finish(stream: TcpStream, https: bool, host: &str) -> Result<EgressStream> {
    let stream: Box<dyn ProxyConnection> = if https {
        Box::new(tls::wrap_client(stream, host).await?)
    } else {
        Box::new(stream)
    };
    Ok(EgressStream {
        stream,
        proxied_plain: false,
        proxy_auth: None,
    })
}

/// Connect to the origin through a SOCKS5 relay
async fn socks_dial(
    relay_host: &str,
    relay_port: u16,
    host: &str,
    port: u16,
) -> anyhow::Result<TcpStream> {
    let socket = TcpStream::connect(format_tcp_addr(relay_host, relay_port))
        .await
        .with_context(|| format!("failed to reach relay {}:{}", relay_host, relay_port))?;
    let stream = Socks5Stream::connect_with_socket(socket, (host, port))
        .await
        .with_context(|| format!("relay refused connection to {}:{}", host, port))?;
    Ok(stream.into_inner())
}

/// Run a CONNECT handshake with an upstream HTTP proxy
async fn establish_proxy_tunnel(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    auth: Option<&HeaderValue>,
) -> anyhow::Result<()> {
    let authority = format_tcp_addr(host, port);
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth.to_str()?));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .context("failed to send CONNECT request")?;

    let mut buf = [0u8; 1024];
    let n = stream
        .read(&mut buf)
        .await
        .context("failed to read CONNECT response")?;
    let response = String::from_utf8_lossy(&buf[..n]);
    if response.starts_with("HTTP/1.1 200") || response.starts_with("HTTP/1.0 200") {
        Ok(())
    } else {
        anyhow::bail!(
            "proxy refused CONNECT: {}",
            response.lines().next().unwrap_or("")
        )
    }
}

/// Encode basic credentials into a `Proxy-Authorization` value
fn basic_auth(username: Option<&str>, password: Option<&str>) -> Option<HeaderValue> {
    let user = username?;
    let credentials = format!("{}:{}", user, password.unwrap_or(""));
    let encoded = BASE64.encode(credentials.as_bytes());
    HeaderValue::from_str(&format!("Basic {}", encoded)).ok()
}

/// Split a `host:port` endpoint, accepting bracketed IPv6 hosts
pub(crate) fn parse_host_port(endpoint: &str) -> Result<(String, u16)> {
    let url = Url::parse(&format!("http://{}", endpoint))?;
    let host = url
        .host_str()
        .ok_or_else(|| CarouselError::InvalidEndpoint(format!("no host in {}", endpoint)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| CarouselError::InvalidEndpoint(format!("no port in {}", endpoint)))?;
    Ok((host, port))
}

/// Format a dialable address, re-bracketing IPv6 hosts
pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
