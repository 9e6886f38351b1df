//! Host-based routing: first DNS label of the request host -> registry entry

use crate::registry::{Registry, ServiceEndpoint};
use hyper::Request;
use std::sync::Arc;

/// Host and routing key extracted from one inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// Raw host as received (may carry a port)
    pub host_header: String,
    /// First `.`-separated label of the host without its port
    pub subdomain: String,
}

impl RouteRequest {
    /// Build a route request from a raw host value.
    ///
    /// A missing or empty host produces an empty subdomain, which never
    /// matches a registered name.
    pub fn from_host(host: Option<&str>) -> Self {
        let host_header = host.unwrap_or_default().trim().to_string();
        let subdomain = subdomain_of(&host_header).to_string();
        Self {
            host_header,
            subdomain,
        }
    }

    /// Both forwarding paths go through here so that `foo.localhost` and
    /// `foo.localhost:80` route the same way.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()));
        Self::from_host(host)
    }
}

/// Strip any `:port` suffix (bracketed IPv6 literals included)
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Routing key for a host: the leading label, no case folding
pub fn subdomain_of(host: &str) -> &str {
    strip_port(host).split('.').next().unwrap_or_default()
}

/// Resolves request hosts against the shared registry
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Look up the endpoint for a route request; `None` means not found
    pub fn resolve(&self, route: &RouteRequest) -> Option<ServiceEndpoint> {
        if route.subdomain.is_empty() {
            return None;
        }
        self.registry.get(&route.subdomain)
    }

    /// Convenience for resolving a raw host string
    pub fn resolve_host(&self, host: &str) -> Option<ServiceEndpoint> {
        self.resolve(&RouteRequest::from_host(Some(host)))
    }
}
