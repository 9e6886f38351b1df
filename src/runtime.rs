//! Narrow interface to the container runtime platform
//!
//! Discovery and provisioning only ever talk to the platform through
//! [`ContainerRuntime`], so the Docker implementation can be swapped for an
//! in-memory one in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Event category for container lifecycle changes
pub const KIND_CONTAINER: &str = "container";
/// Action emitted when a container has started
pub const ACTION_START: &str = "start";
/// Action emitted when a container's main process has exited
pub const ACTION_DIE: &str = "die";

/// One decoded record from the platform event feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Event category, e.g. `container`, `network`, `image`
    pub kind: String,
    /// Action within the category, e.g. `start`, `die`, `create`
    pub action: String,
    /// Id of the object the event is about
    pub id: String,
    /// Object name attribute, when the platform includes one
    pub name: Option<String>,
}

impl RuntimeEvent {
    pub fn new(kind: impl Into<String>, action: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            action: action.into(),
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_container(&self, action: &str) -> bool {
        self.kind == KIND_CONTAINER && self.action == action
    }
}

/// What the platform reports about an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub id: String,
    /// Platform-assigned name, usually with a leading `/`
    pub name: String,
    /// Address reachable from the proxy host (may be empty)
    pub network_address: String,
    /// Declared exposed ports as `port/transport` strings, in enumeration order
    pub exposed_ports: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The event feed could not be opened or broke; not recoverable by the listener
    #[error("event subscription failed: {0}")]
    Subscription(String),
    /// One event could not be decoded; the feed itself is still usable
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("image pull failed for '{image}': {message}")]
    Pull { image: String, message: String },
    /// Any other failure reported by the platform API
    #[error("runtime API error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// Whether this error ends the event subscription
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Subscription(_))
    }
}

/// Stream of lifecycle events; lazily opened, potentially infinite
pub type EventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Open a subscription to the lifecycle event feed
    fn events(&self) -> EventStream;

    /// Fetch name, address and exposed ports of an instance
    async fn inspect(&self, id: &str) -> Result<InstanceDescriptor, RuntimeError>;

    /// Whether `reference` (`image:tag`) is present locally
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Create a new instance from `reference`, returning its id
    async fn create_instance(&self, reference: &str) -> Result<String, RuntimeError>;

    async fn start_instance(&self, id: &str) -> Result<(), RuntimeError>;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_container_action() {
        let event = RuntimeEvent::new("container", "start", "c1");
        assert!(event.is_container(ACTION_START));
        assert!(!event.is_container(ACTION_DIE));

        let network = RuntimeEvent::new("network", "start", "n1");
        assert!(!network.is_container(ACTION_START));
    }

    #[test]
    fn test_only_subscription_errors_are_fatal() {
        assert!(RuntimeError::Subscription("closed".into()).is_fatal());
        assert!(!RuntimeError::MalformedEvent("bad".into()).is_fatal());
        assert!(!RuntimeError::NotFound("c1".into()).is_fatal());
        assert!(!RuntimeError::Api("500 Internal Server Error".into()).is_fatal());
    }
}
