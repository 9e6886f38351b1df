use crate::error::{json_error_response, not_found_response, ProxyError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::registry::ServiceEndpoint;
use crate::router::{RouteRequest, Router};
use crate::splice::splice;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest backend response head accepted on the upgrade path
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// Per-request state shared by every connection of one listener
struct ProxyContext {
    router: Router,
    pool: ConnectionPool,
    /// Time allowed for a backend to produce a response head
    request_timeout: Duration,
    /// Time allowed for dialing a backend on the upgrade path
    connect_timeout: Duration,
}

/// The subdomain-routing reverse proxy listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn with_pool_config(
        bind_addr: SocketAddr,
        router: Router,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        let connect_timeout = pool_config.connect_timeout;
        Self {
            bind_addr,
            shutdown_rx,
            ctx: Arc::new(ProxyContext {
                router,
                pool: ConnectionPool::new(pool_config),
                request_timeout,
                connect_timeout,
            }),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let route = RouteRequest::from_request(&req);

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    set_forwarding_headers(&mut req, &request_id, client_addr);

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &ctx, route, request_id).await;
    }

    let Some(endpoint) = ctx.router.resolve(&route) else {
        debug!(host = %route.host_header, subdomain = %route.subdomain, request_id, "No container registered for host");
        return Ok(not_found_response());
    };

    debug!(
        host = %route.host_header,
        method = %req.method(),
        uri = %req.uri(),
        upstream = %endpoint.origin(),
        request_id,
        "Forwarding request"
    );

    let result = tokio::time::timeout(ctx.request_timeout, ctx.pool.send_request(req, &endpoint)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(PoolError::RequestBuild(e))) => {
            error!(
                name = %endpoint.name,
                upstream = %endpoint.origin(),
                error = %e,
                request_id,
                "Could not build backend request"
            );
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to build backend request",
            ))
        }
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(
                name = %endpoint.name,
                upstream = %endpoint.origin(),
                connect = e.is_connect(),
                error = %e,
                request_id,
                "Failed to forward request"
            );
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                name = %endpoint.name,
                upstream = %endpoint.origin(),
                timeout_secs = ctx.request_timeout.as_secs(),
                request_id,
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    ctx.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Set X-Request-ID and X-Forwarded-* headers.
///
/// X-Forwarded-* values are overwritten rather than appended: this proxy is
/// the first trusted hop.
fn set_forwarding_headers<B>(req: &mut Request<B>, request_id: &str, client_addr: SocketAddr) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Check if a request asks for a protocol upgrade (e.g. WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> String {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Serialize the inbound upgrade request so it can be replayed verbatim
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    request
}

/// Backend response head plus any bytes that followed it in the same reads
struct ResponseHead {
    head: Vec<u8>,
    rest: Vec<u8>,
}

/// Read from the backend until the end of the response head
async fn read_response_head<R>(reader: &mut R) -> std::io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok(ResponseHead { head: buf, rest });
        }

        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend upgrade response head too large",
            ));
        }
    }
}

/// Parse status and headers from a raw HTTP response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Parse status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn backend_unreachable(endpoint: &ServiceEndpoint, reason: impl Into<String>) -> ProxyError {
    ProxyError::BackendUnreachable {
        upstream: endpoint.origin(),
        reason: reason.into(),
    }
}

/// Open the backend connection, replay the upgrade request, and read the
/// backend's response head
async fn dial_upgrade(
    req: &Request<Incoming>,
    endpoint: &ServiceEndpoint,
    ctx: &ProxyContext,
) -> Result<(TcpStream, ResponseHead), ProxyError> {
    let mut backend = match tokio::time::timeout(ctx.connect_timeout, TcpStream::connect(endpoint.authority())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(backend_unreachable(endpoint, e.to_string())),
        Err(_) => return Err(backend_unreachable(endpoint, "connect timed out")),
    };
    let _ = backend.set_nodelay(true);

    backend
        .write_all(&build_upgrade_request(req))
        .await
        .map_err(|e| backend_unreachable(endpoint, format!("failed to send upgrade request: {}", e)))?;

    let head = match tokio::time::timeout(ctx.request_timeout, read_response_head(&mut backend)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => return Err(backend_unreachable(endpoint, e.to_string())),
        Err(_) => return Err(backend_unreachable(endpoint, "timed out waiting for upgrade response")),
    };

    Ok((backend, head))
}

/// Handle a protocol upgrade request.
///
/// Unknown hosts and unreachable backends produce an error, which closes the
/// caller's connection without a response.
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: &ProxyContext,
    route: RouteRequest,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let Some(endpoint) = ctx.router.resolve(&route) else {
        debug!(host = %route.host_header, request_id, "Rejecting upgrade for unknown host");
        return Err(ProxyError::RouteMiss(route.host_header));
    };

    let upgrade_type = get_upgrade_type(&req);
    debug!(name = %endpoint.name, upstream = %endpoint.origin(), request_id, upgrade_type, "Handling upgrade request");

    let (mut backend, head) = match dial_upgrade(&req, &endpoint, ctx).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(name = %endpoint.name, request_id, error = %e, "Upgrade backend unavailable, closing connection");
            return Err(e);
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head.head) else {
        warn!(name = %endpoint.name, request_id, "Invalid upgrade response from backend, closing connection");
        return Err(backend_unreachable(&endpoint, "invalid upgrade response"));
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        // hyper frames the relayed response itself
        let name_lower = name.to_ascii_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .map_err(|e| backend_unreachable(&endpoint, format!("invalid backend response header: {}", e)))?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(name = %endpoint.name, status = %status, request_id, "Backend rejected upgrade request");
        return Ok(response);
    }

    info!(name = %endpoint.name, request_id, upgrade_type, "Upgrade accepted, splicing connection");

    let name = endpoint.name.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match splice(&mut client, &mut backend, &head.rest).await {
                    Ok(stats) => debug!(
                        name,
                        request_id,
                        client_to_backend = stats.client_to_backend,
                        backend_to_client = stats.backend_to_client,
                        "Upgraded connection closed"
                    ),
                    Err(e) => debug!(name, request_id, error = %e, "Upgraded connection closed with error"),
                }
            }
            Err(e) => {
                error!(name, request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
