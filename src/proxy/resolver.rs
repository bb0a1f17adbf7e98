//! Request resolution with backend rotation
//!
//! Forwards an intercepted request through rotating egress backends until a
//! response is acceptable or the attempt budget runs out. Rejections (403,
//! 503, or a challenge page on amazon domains) rotate to a fresh endpoint;
//! dial and forwarding failures abort the resolution with no response.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CarouselError, Result};
use crate::models::{AttemptRecord, BackendClass};
use crate::proxy::audit::AuditStore;
use crate::proxy::rotation::RotationPools;
use crate::proxy::transport::{self, TransportConfig};
use crate::proxy::{agents, blacklist, heuristic};

/// Attempt budget for one resolution
const MAX_TRIES: u32 = 6;

/// Attempt count after which a dynamic resolution stops using relays
const RELAY_DEGRADE_AFTER: u32 = 4;

/// Resolves intercepted requests through rotating egress backends
pub struct Resolver {
    class: BackendClass,
    from_tunnel: bool,
    pools: Arc<RotationPools>,
    audit: AuditStore,
}

/// The origin a resolution is aimed at
#[derive(Debug)]
struct ResolvedTarget {
    uri: Uri,
    domain: String,
    host: String,
    port: u16,
    https: bool,
}

/// Outcome of inspecting one attempt's response
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Accept,
    Retry { challenge: bool },
}

/// Backend selection state across the attempt loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryState {
    /// Dynamic resolution in its relay phase
    UseTor,
    /// Dynamic resolution after degrading to the proxy pool
    UseHttpDegraded,
    /// Fixed class chosen at startup
    UseFixedClass(BackendClass),
    /// Response accepted
    Stopped,
    /// Attempt budget spent
    Exhausted,
}

impl RetryState {
    fn initial(class: BackendClass, relay_hostile: bool) -> RetryState {
        match class {
            BackendClass::Dynamic if relay_hostile => RetryState::UseHttpDegraded,
            BackendClass::Dynamic => RetryState::UseTor,
            other => RetryState::UseFixedClass(other),
        }
    }

    /// Backend class for the next attempt, `None` once the loop is over
    fn effective_class(&self) -> Option<BackendClass> {
        match self {
            RetryState::UseTor => Some(BackendClass::Tor),
            RetryState::UseHttpDegraded => Some(BackendClass::Http),
            RetryState::UseFixedClass(class) => Some(*class),
            RetryState::Stopped | RetryState::Exhausted => None,
        }
    }

    /// Fold the verdict of completed attempt number `attempt` into the state
    fn advance(self, attempt: u32, verdict: &Verdict) -> RetryState {
        match verdict {
            Verdict::Accept => RetryState::Stopped,
            Verdict::Retry { .. } => {
                if attempt >= MAX_TRIES {
                    RetryState::Exhausted
                } else if self == RetryState::UseTor && attempt >= RELAY_DEGRADE_AFTER {
                    RetryState::UseHttpDegraded
                } else {
                    self
                }
            }
        }
    }
}

impl Resolver {
    pub fn new(
        class: BackendClass,
        from_tunnel: bool,
        pools: Arc<RotationPools>,
        audit: AuditStore,
    ) -> Self {
        Self {
            class,
            from_tunnel,
            pools,
            audit,
        }
    }

    /// Resolve one intercepted request to a response
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn resolve<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| CarouselError::InvalidRequest(format!("failed to read body: {}", e)))?
            .to_bytes();

        let (target, headers) = resolve_target(self.from_tunnel, &parts)?;

        let relay_hostile = blacklist::is_blocked(&target.domain);
        if relay_hostile && self.class == BackendClass::Tor {
            warn!(domain = %target.domain, "Domain refuses relay egress");
            return Err(CarouselError::BackendBlocked(target.domain));
        }

        let mut state = RetryState::initial(self.class, relay_hostile);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last: Option<(http::response::Parts, Bytes)> = None;
        let mut attempt = 0u32;

        while let Some(class) = state.effective_class() {
            attempt += 1;
            let picked = self.pools.pick(class)?;
            let agent = agents::random_agent();
            let config = TransportConfig::build(class, picked.endpoint.as_deref())?;

            debug!(
                endpoint = %picked.display,
                "Forwarding through {} backend (attempt {}/{})",
                class.as_str(),
                attempt,
                MAX_TRIES
            );

            let (response_parts, response_body) = self
                .forward_attempt(
                    &target,
                    &headers,
                    &parts.method,
                    body_bytes.clone(),
                    &config,
                    agent,
                )
                .await?;

            let verdict = retry_verdict(response_parts.status, &target.domain, &response_body);
            let record = AttemptRecord {
                attempt,
                class,
                endpoint: picked.display,
                user_agent: agent.to_string(),
                status: response_parts.status.as_u16(),
                challenge: verdict == Verdict::Retry { challenge: true },
            };
            if record.retried() {
                warn!(
                    status = record.status,
                    challenge = record.challenge,
                    endpoint = %record.endpoint,
                    "Backend rejected request, rotating (attempt {}/{})",
                    attempt,
                    MAX_TRIES
                );
            }
            attempts.push(record);

            last = Some((response_parts, response_body));
            state = state.advance(attempt, &verdict);
        }

        let Some((response_parts, response_body)) = last else {
            return Err(CarouselError::Internal(
                "resolution produced no response".to_string(),
            ));
        };

        let artifact = self
            .audit
            .persist(response_parts.status, &target.domain, &response_body)
            .await?;

        let status = response_parts.status;
        if status == StatusCode::FORBIDDEN || status == StatusCode::SERVICE_UNAVAILABLE {
            error!(
                status = status.as_u16(),
                domain = %target.domain,
                attempts = attempts.len(),
                artifact = %artifact.display(),
                "Resolution exhausted with rejection"
            );
        } else {
            info!(
                status = status.as_u16(),
                domain = %target.domain,
                attempts = attempts.len(),
                artifact = %artifact.display(),
                "Resolution complete"
            );
        }

        Ok(Response::from_parts(response_parts, Full::new(response_body)))
    }

    /// Forward the request once through the given transport
    async fn forward_attempt(
        &self,
        target: &ResolvedTarget,
        headers: &HeaderMap,
        method: &Method,
        body: Bytes,
        config: &TransportConfig,
        agent: &'static str,
    ) -> Result<(http::response::Parts, Bytes)> {
        let egress = config
            .connect(target.https, &target.host, target.port)
            .await?;

        // absolute form towards an upstream proxy, origin form otherwise
        let uri_str = if egress.proxied_plain {
            target.uri.to_string()
        } else {
            target
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string()
        };

        let mut request = Request::builder()
            .method(method.clone())
            .uri(&uri_str)
            .body(Full::new(body))
            .map_err(|e| {
                CarouselError::InvalidRequest(format!("failed to build request: {}", e))
            })?;
        *request.headers_mut() = headers.clone();
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(agent));
        if let Some(auth) = &egress.proxy_auth {
            request.headers_mut().insert(PROXY_AUTHORIZATION, auth.clone());
        }

        let io = TokioIo::new(egress.stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CarouselError::TransportExecution(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| CarouselError::TransportExecution(format!("request failed: {}", e)))?;

        let (response_parts, response_body) = response.into_parts();
        let body_bytes = response_body
            .collect()
            .await
            .map_err(|e| {
                CarouselError::TransportExecution(format!("failed to read response: {}", e))
            })?
            .to_bytes();

        Ok((response_parts, body_bytes))
    }
}

/// Decide whether a response is deliverable or grounds for rotation
fn retry_verdict(status: StatusCode, domain: &str, body: &[u8]) -> Verdict {
    if status == StatusCode::FORBIDDEN || status == StatusCode::SERVICE_UNAVAILABLE {
        return Verdict::Retry { challenge: false };
    }
    if domain.contains("amazon") && heuristic::is_challenge(body) {
        return Verdict::Retry { challenge: true };
    }
    Verdict::Accept
}

/// Derive the origin target and forwardable headers from the parsed request
///
/// The authority of an absolute request target takes precedence over the
/// Host header. Tunnelled requests are rewritten to `https://<domain><path>`,
/// which pins the origin port to 443.
fn resolve_target(
    from_tunnel: bool,
    parts: &http::request::Parts,
) -> Result<(ResolvedTarget, HeaderMap)> {
    let mut headers = parts.headers.clone();
    headers.remove("proxy-connection");

    let raw_host = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| CarouselError::InvalidRequest("no host in request".to_string()))?;

    if !headers.contains_key(HOST) {
        let value = HeaderValue::from_str(&raw_host)
            .map_err(|e| CarouselError::InvalidRequest(format!("invalid host: {}", e)))?;
        headers.insert(HOST, value);
    }

    let padded = if raw_host.contains(':') {
        raw_host
    } else {
        format!("{}:80", raw_host)
    };
    let (domain, _) = transport::parse_host_port(&padded)?;

    let target = if from_tunnel {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("https://{}{}", domain, path).parse().map_err(
            |e: http::uri::InvalidUri| {
                CarouselError::InvalidRequest(format!("failed to rewrite target: {}", e))
            },
        )?;
        ResolvedTarget {
            uri,
            host: domain.clone(),
            domain,
            port: 443,
            https: true,
        }
    } else {
        let host = parts
            .uri
            .host()
            .ok_or_else(|| {
                CarouselError::InvalidRequest("request target must be absolute".to_string())
            })?
            .to_string();
        let https = parts.uri.scheme_str() == Some("https");
        let port = parts
            .uri
            .port_u16()
            .unwrap_or(if https { 443 } else { 80 });
        ResolvedTarget {
            uri: parts.uri.clone(),
            domain,
            host,
            port,
            https,
        }
    };

    Ok((target, headers))
}
