use crate::provision::{ProvisionError, ProvisionRequest, Provisioner};
use crate::registry::Registry;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest provisioning request body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn status_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "status": "error",
        "message": message.to_string(),
    });
    json_response(status, body.to_string())
}

/// Shared state behind every management request
pub struct AdminState {
    provisioner: Provisioner,
    registry: Arc<Registry>,
    auth_token: Option<String>,
}

impl AdminState {
    pub fn new(provisioner: Provisioner, registry: Arc<Registry>, auth_token: Option<String>) -> Self {
        Self {
            provisioner,
            registry,
            auth_token,
        }
    }
}

/// Management API server: container provisioning and route inspection
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.state.auth_token.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, auth = self.auth_enabled(), "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let authorized = check_auth(&req, state.auth_token.as_deref());

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Create and start a container: POST /containers
        (&Method::POST, "/containers") => {
            if !authorized {
                warn!(%path, "Unauthorized admin API request");
                status_error(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                create_container(req, &state).await
            }
        }

        // Current routing table: GET /routes
        (&Method::GET, "/routes") => {
            if !authorized {
                warn!(%path, "Unauthorized admin API request");
                status_error(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let routes = state.registry.snapshot();
                let response_body = serde_json::json!({
                    "count": routes.len(),
                    "routes": routes,
                });
                json_response(StatusCode::OK, response_body.to_string())
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn create_container<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return status_error(StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)),
    };

    let request: ProvisionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected provisioning request");
            return status_error(StatusCode::BAD_REQUEST, format!("invalid request: {}", e));
        }
    };

    match state.provisioner.provision(&request).await {
        Ok(hostname) => {
            let body = serde_json::json!({
                "status": "success",
                "container": hostname,
            });
            json_response(StatusCode::OK, body.to_string())
        }
        Err(ProvisionError::InvalidRequest(message)) => {
            status_error(StatusCode::BAD_REQUEST, format!("invalid request: {}", message))
        }
        Err(e @ ProvisionError::Runtime(_)) => {
            error!(image = %request.reference(), error = %e, "Provisioning failed");
            status_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceEndpoint;
    use crate::runtime::{ContainerRuntime, EventStream, InstanceDescriptor, RuntimeError};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct FixedRuntime {
        fail: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FixedRuntime {
        fn events(&self) -> EventStream {
            futures::stream::empty().boxed()
        }

        async fn inspect(&self, id: &str) -> Result<InstanceDescriptor, RuntimeError> {
            Ok(InstanceDescriptor {
                id: id.to_string(),
                name: "/eager_hopper".to_string(),
                network_address: "172.17.0.3".to_string(),
                exposed_ports: vec!["80/tcp".to_string()],
            })
        }

        async fn image_exists(&self, _reference: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }

        async fn pull_image(&self, _reference: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn create_instance(&self, reference: &str) -> Result<String, RuntimeError> {
            if self.fail {
                return Err(RuntimeError::Pull {
                    image: reference.to_string(),
                    message: "manifest unknown".to_string(),
                });
            }
            Ok("abc123".to_string())
        }

        async fn start_instance(&self, _id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn state(fail: bool, token: Option<&str>) -> Arc<AdminState> {
        let provisioner = Provisioner::new(Arc::new(FixedRuntime { fail }), "localhost");
        let registry = Arc::new(Registry::new());
        registry.put("web", ServiceEndpoint::new("web", "172.17.0.2", 80, "c1"));
        Arc::new(AdminState::new(provisioner, registry, token.map(String::from)))
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn call(req: Request<Full<Bytes>>, state: Arc<AdminState>) -> (StatusCode, serde_json::Value) {
        let response = handle_admin_request(req, state).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_provision_success() {
        let req = request(Method::POST, "/containers", r#"{"image":"nginx"}"#);
        let (status, body) = call(req, state(false, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["container"], "eager_hopper.localhost");
    }

    #[tokio::test]
    async fn test_provision_bad_json() {
        let req = request(Method::POST, "/containers", "{not json");
        let (status, body) = call(req, state(false, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_provision_missing_image() {
        let req = request(Method::POST, "/containers", r#"{"tag":"1.0"}"#);
        let (status, body) = call(req, state(false, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("image"));
    }

    #[tokio::test]
    async fn test_provision_runtime_failure() {
        let req = request(Method::POST, "/containers", r#"{"image":"ghost","tag":"0"}"#);
        let (status, body) = call(req, state(true, None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("ghost:0"));
    }

    #[tokio::test]
    async fn test_routes_listing() {
        let req = request(Method::GET, "/routes", "");
        let (status, body) = call(req, state(false, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["routes"][0]["name"], "web");
        assert_eq!(body["routes"][0]["port"], 80);
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let shared = state(false, Some("s3cret"));

        let req = request(Method::GET, "/routes", "");
        let (status, _) = call(req, Arc::clone(&shared)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut req = request(Method::GET, "/routes", "");
        req.headers_mut()
            .insert(AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let (status, _) = call(req, Arc::clone(&shared)).await;
        assert_eq!(status, StatusCode::OK);

        let req = request(Method::GET, "/health", "");
        let response = handle_admin_request(req, shared).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_version() {
        let req = request(Method::GET, "/version", "");
        let (status, body) = call(req, state(false, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], PKG_NAME);
        assert_eq!(body["version"], VERSION);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let req = request(Method::DELETE, "/containers", "");
        let response = handle_admin_request(req, state(false, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_when_shutdown_sender_dropped() {
        let provisioner = Provisioner::new(Arc::new(FixedRuntime { fail: false }), "localhost");
        let admin_state = AdminState::new(provisioner, Arc::new(Registry::new()), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::new(addr, admin_state, shutdown_rx);
        drop(shutdown_tx);

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server.serve(listener)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
