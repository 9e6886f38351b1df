//! In-memory routing table keyed by service name
//!
//! The registry is the single source of truth for routing decisions. It is
//! written by the discovery listener and read by every inbound request, so
//! it is backed by a sharded concurrent map: readers never observe a
//! partially written endpoint, and a write to one name does not block reads
//! of another.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Where a named service can currently be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    /// Public routing name (instance name without the platform's leading `/`)
    pub name: String,
    /// Network address reported by the platform at registration time
    pub address: String,
    /// Default TCP port selected from the instance's exposed ports
    pub port: u16,
    /// Platform id of the instance this endpoint was resolved from
    pub instance_id: String,
}

impl ServiceEndpoint {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            instance_id: instance_id.into(),
        }
    }

    /// `address:port`, used for dialing and as the rewritten Host header
    pub fn authority(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Base URL of the backend, e.g. `http://172.17.0.2:8080`
    pub fn origin(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name, self.origin())
    }
}

/// Concurrent name -> endpoint map with last-write-wins semantics
#[derive(Debug, Default)]
pub struct Registry {
    routes: DashMap<String, ServiceEndpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the endpoint for `name`.
    ///
    /// Returns the endpoint that was replaced, if any.
    pub fn put(&self, name: impl Into<String>, endpoint: ServiceEndpoint) -> Option<ServiceEndpoint> {
        let name = name.into();
        debug!(name, upstream = %endpoint.origin(), "Registry put");
        self.routes.insert(name, endpoint)
    }

    /// Look up the current endpoint for `name` (exact match)
    pub fn get(&self, name: &str) -> Option<ServiceEndpoint> {
        self.routes.get(name).map(|entry| entry.value().clone())
    }

    /// Remove `name` only while it still points at `instance_id`.
    ///
    /// A name that has since been taken over by another instance is left alone.
    pub fn remove_if_instance(&self, name: &str, instance_id: &str) -> Option<ServiceEndpoint> {
        self.routes
            .remove_if(name, |_, endpoint| endpoint.instance_id == instance_id)
            .map(|(_, endpoint)| endpoint)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Point-in-time copy of all routes, sorted by name
    pub fn snapshot(&self) -> Vec<ServiceEndpoint> {
        let mut routes: Vec<ServiceEndpoint> = self
            .routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
