//! Pooled HTTP client for forwarding requests to backend containers

use crate::registry::ServiceEndpoint;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single hop and must not be forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// Whether the backend could not be reached at all (refused, timed out connecting)
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upper bound on establishing a backend TCP connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Connection pool initialized"
        );

        Self { client }
    }

    /// Forward a request to `endpoint`, streaming both bodies.
    ///
    /// The Host header is rewritten to the backend's authority and hop-by-hop
    /// headers are dropped; everything else passes through.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        endpoint: &ServiceEndpoint,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let authority = endpoint.authority();
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("http://{}{}", authority, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri);

        if let Some(headers) = builder.headers_mut() {
            *headers = forwardable_headers(&parts.headers);
            let host = HeaderValue::from_str(&authority)
                .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
            headers.insert(HOST, host);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Copy of `headers` without hop-by-hop headers, including any named in `Connection`
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) || listed.contains(name) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_forwardable_headers_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-internal"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-internal", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.append("cookie", HeaderValue::from_static("a=1"));
        headers.append("cookie", HeaderValue::from_static("b=2"));

        let forwarded = forwardable_headers(&headers);

        assert!(forwarded.get("connection").is_none());
        assert!(forwarded.get("keep-alive").is_none());
        assert!(forwarded.get("transfer-encoding").is_none());
        assert!(forwarded.get("x-internal").is_none());
        assert_eq!(forwarded.get("accept").unwrap(), "text/html");
        assert_eq!(forwarded.get_all("cookie").iter().count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_a_build_error() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let endpoint = ServiceEndpoint::new("bad", "not a host", 80, "c1");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = tokio::sync::oneshot::channel();

        // Only a server connection yields a Request<Incoming>
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let req_tx = std::sync::Mutex::new(Some(req_tx));
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                if let Some(tx) = req_tx.lock().unwrap().take() {
                    let _ = tx.send(req);
                }
                async { Ok::<_, hyper::Error>(Response::new(http_body_util::Empty::<Bytes>::new())) }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                .await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"GET / HTTP/1.1\r\nHost: bad.localhost\r\n\r\n")
            .await
            .unwrap();
        let req = req_rx.await.unwrap();

        let err = pool.send_request(req, &endpoint).await.unwrap_err();
        assert!(matches!(err, PoolError::RequestBuild(_)));
        assert!(!err.is_connect());
    }
}
