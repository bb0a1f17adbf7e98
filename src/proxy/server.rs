//! Bridge server wiring the client listener to the upgrade listeners
//!
//! Three sockets make up the bridge: the client-facing listener feeds raw
//! connections into [`Session`]s, and the two loopback upgrade listeners
//! (plain and TLS-terminating) parse the bridged streams with hyper and
//! hand each request to a [`Resolver`].

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{CarouselError, Result};
use crate::proxy::audit::AuditStore;
use crate::proxy::resolver::Resolver;
use crate::proxy::rotation::RotationPools;
use crate::proxy::session::{Session, UpgradeTargets};
use crate::proxy::tls;

/// The intercepting bridge and its two upgrade listeners
pub struct BridgeServer {
    listener: TcpListener,
    plain_listener: TcpListener,
    tls_listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    targets: UpgradeTargets,
    resolver_plain: Arc<Resolver>,
    resolver_tls: Arc<Resolver>,
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer").finish_non_exhaustive()
    }
}

impl BridgeServer {
    /// Bind all three listeners and prepare the resolvers
    pub async fn bind(config: &Config, pools: Arc<RotationPools>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let plain_listener = TcpListener::bind(config.upgrade.plain_addr).await?;
        let tls_listener = TcpListener::bind(config.upgrade.tls_addr).await?;

        let server_config =
            tls::load_server_config(&config.upgrade.cert_path, &config.upgrade.key_path)?;
        let tls_acceptor = TlsAcceptor::from(Arc::new(server_config));

        let targets = UpgradeTargets {
            plain: plain_listener.local_addr()?,
            tls: tls_listener.local_addr()?,
        };

        let audit = AuditStore::new(&config.audit_dir);
        audit.ensure_dir()?;

        let resolver_plain = Arc::new(Resolver::new(
            config.backend,
            false,
            pools.clone(),
            audit.clone(),
        ));
        let resolver_tls = Arc::new(Resolver::new(config.backend, true, pools, audit));

        Ok(Self {
            listener,
            plain_listener,
            tls_listener,
            tls_acceptor,
            targets,
            resolver_plain,
            resolver_tls,
        })
    }

    /// Address of the client-facing listener
    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the bridge until shutdown is signalled
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let BridgeServer {
            listener,
            plain_listener,
            tls_listener,
            tls_acceptor,
            targets,
            resolver_plain,
            resolver_tls,
        } = self;

        info!("Bridge listening on {}", listener.local_addr()?);
        info!("Plain upgrade listener on {}", targets.plain);
        info!("TLS upgrade listener on {}", targets.tls);

        let plain = tokio::spawn(serve_upgrade(
            plain_listener,
            None,
            resolver_plain,
            shutdown.clone(),
        ));
        let tls = tokio::spawn(serve_upgrade(
            tls_listener,
            Some(tls_acceptor),
            resolver_tls,
            shutdown.clone(),
        ));

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            tokio::spawn(Session::new(stream, peer, targets).run());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Bridge server shutting down");
                        break;
                    }
                }
            }
        }

        let _ = plain.await;
        let _ = tls.await;
        Ok(())
    }
}

/// Accept loop for one upgrade listener
async fn serve_upgrade(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _)) => {
                        let acceptor = acceptor.clone();
                        let resolver = resolver.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_resolver_connection(stream, acceptor, resolver).await
                            {
                                debug!("Upgrade connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Serve one bridged connection with hyper
///
/// A resolution error tears the connection down without writing a response;
/// the client only ever sees responses that passed the audit trail.
async fn serve_resolver_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    resolver: Arc<Resolver>,
) -> Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let resolver = resolver.clone();
        async move {
            resolver.resolve(req).await.map_err(|e| {
                if e.aborts_resolution() {
                    error!("Resolution aborted: {}", e);
                } else {
                    debug!("Resolution failed: {}", e);
                }
                e
            })
        }
    });

    match acceptor {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .await
                .map_err(|e| CarouselError::Http(e.to_string()))?;
        }
        None => {
            http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .await
                .map_err(|e| CarouselError::Http(e.to_string()))?;
        }
    }
    Ok(())
}
