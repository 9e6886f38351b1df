//! Discovery listener: keeps the registry in step with the event feed
//!
//! One long-lived subscription is consumed by a single task. Each event is
//! processed to completion before the next is read, so registrations for a
//! given name are applied in feed order. Per-event failures (undecodable
//! records, instances that vanished before inspection) are logged and
//! skipped; only a broken or closed subscription ends the listener.

use crate::registry::{Registry, ServiceEndpoint};
use crate::runtime::{RuntimeEvent, SharedRuntime, ACTION_DIE, ACTION_START};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Prefix the platform puts in front of instance names
const NAME_PREFIX: char = '/';

/// What happened to the registry as a result of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Event did not concern a container start/die
    Ignored,
    Registered(ServiceEndpoint),
    /// Started instance declares no usable TCP port
    NoTcpPort { name: String },
    /// Instance could not be inspected
    InspectFailed { id: String },
    Deregistered(ServiceEndpoint),
    /// Die event for a name that is not (or no longer) owned by that instance
    Unchanged,
}

/// Options for the discovery listener
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Remove routes when their instance dies
    pub deregister_on_stop: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            deregister_on_stop: true,
        }
    }
}

pub struct Discovery {
    runtime: SharedRuntime,
    registry: Arc<Registry>,
    options: DiscoveryOptions,
}

impl Discovery {
    pub fn new(runtime: SharedRuntime, registry: Arc<Registry>, options: DiscoveryOptions) -> Self {
        Self {
            runtime,
            registry,
            options,
        }
    }

    /// Consume the event feed until shutdown.
    ///
    /// Returns `Ok` on shutdown and `Err` when the subscription fails or
    /// closes; there is no reconnect here, restarting is left to whatever
    /// supervises the process.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut events = self.runtime.events();
        info!(
            deregister_on_stop = self.options.deregister_on_stop,
            "Discovery listener subscribed to runtime events"
        );

        loop {
            tokio::select! {
                next = events.next() => {
                    match next {
                        Some(Ok(event)) => {
                            self.handle_event(&event).await;
                        }
                        Some(Err(e)) if e.is_fatal() => {
                            return Err(anyhow::anyhow!("Runtime event subscription failed: {}", e));
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Skipping undecodable runtime event");
                        }
                        None => {
                            anyhow::bail!("Runtime event feed closed");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Discovery listener shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Apply one event to the registry
    pub async fn handle_event(&self, event: &RuntimeEvent) -> Outcome {
        if event.is_container(ACTION_START) {
            self.register(&event.id).await
        } else if event.is_container(ACTION_DIE) && self.options.deregister_on_stop {
            self.deregister(event)
        } else {
            debug!(kind = %event.kind, action = %event.action, id = %event.id, "Ignoring runtime event");
            Outcome::Ignored
        }
    }

    async fn register(&self, id: &str) -> Outcome {
        let descriptor = match self.runtime.inspect(id).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(id, error = %e, "Failed to inspect started container, skipping");
                return Outcome::InspectFailed { id: id.to_string() };
            }
        };

        let name = public_name(&descriptor.name).to_string();
        if name.is_empty() {
            warn!(id, "Started container has no name, skipping");
            return Outcome::InspectFailed { id: id.to_string() };
        }

        let Some(port) = default_port(&descriptor.exposed_ports) else {
            info!(name, id, ports = ?descriptor.exposed_ports, "Container exposes no TCP port, not registering");
            return Outcome::NoTcpPort { name };
        };

        if descriptor.network_address.is_empty() {
            warn!(name, id, "Container has no network address");
        }

        let endpoint = ServiceEndpoint::new(name.clone(), descriptor.network_address, port, descriptor.id);
        info!(name, upstream = %endpoint.origin(), "Registered container");
        self.registry.put(name, endpoint.clone());
        Outcome::Registered(endpoint)
    }

    fn deregister(&self, event: &RuntimeEvent) -> Outcome {
        let Some(name) = event.name.as_deref().map(public_name) else {
            debug!(id = %event.id, "Die event without container name");
            return Outcome::Unchanged;
        };

        match self.registry.remove_if_instance(name, &event.id) {
            Some(endpoint) => {
                info!(name, id = %event.id, "Deregistered stopped container");
                Outcome::Deregistered(endpoint)
            }
            None => Outcome::Unchanged,
        }
    }
}

/// Instance name without the platform's leading separator
pub fn public_name(raw: &str) -> &str {
    raw.strip_prefix(NAME_PREFIX).unwrap_or(raw)
}

/// First TCP port in declaration order.
///
/// Entries look like `8080/tcp`; a bare `8080` is TCP as well. Entries whose
/// port does not parse as a non-zero `u16` are skipped.
pub fn default_port<S: AsRef<str>>(exposed_ports: &[S]) -> Option<u16> {
    exposed_ports.iter().find_map(|spec| {
        let spec = spec.as_ref();
        let (port, transport) = spec.split_once('/').unwrap_or((spec, "tcp"));
        if !transport.eq_ignore_ascii_case("tcp") {
            return None;
        }
        port.parse::<u16>().ok().filter(|p| *p != 0)
    })
}
