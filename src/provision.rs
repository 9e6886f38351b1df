//! Creation of new backend containers on operator request
//!
//! Provisioning only asks the runtime to create and start a container. The
//! route appears once the discovery listener sees the start event.

use crate::discovery::public_name;
use crate::runtime::{RuntimeError, SharedRuntime};
use serde::Deserialize;
use tracing::{debug, info};

fn default_tag() -> String {
    "latest".to_string()
}

/// Body of `POST /containers`
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

impl ProvisionRequest {
    /// `image:tag` as understood by the runtime
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub struct Provisioner {
    runtime: SharedRuntime,
    domain_suffix: String,
}

impl Provisioner {
    pub fn new(runtime: SharedRuntime, domain_suffix: impl Into<String>) -> Self {
        Self {
            runtime,
            domain_suffix: domain_suffix.into(),
        }
    }

    /// Ensure the image is present, then create and start a container from it.
    ///
    /// Returns the hostname the container will be reachable under once the
    /// discovery listener registers it.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProvisionError> {
        if request.image.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("image must not be empty".into()));
        }
        if request.tag.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("tag must not be empty".into()));
        }

        let reference = request.reference();

        let pulled = if self.runtime.image_exists(&reference).await? {
            debug!(image = %reference, "Image exists locally, skipping pull");
            false
        } else {
            info!(image = %reference, "Pulling image");
            self.runtime.pull_image(&reference).await?;
            true
        };

        let id = self.runtime.create_instance(&reference).await?;
        self.runtime.start_instance(&id).await?;

        let descriptor = self.runtime.inspect(&id).await?;
        let name = public_name(&descriptor.name).to_string();
        let hostname = format!("{}.{}", name, self.domain_suffix);

        info!(image = %reference, id, hostname, pulled, "Provisioned container");
        Ok(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, EventStream, InstanceDescriptor};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    /// Records every runtime call in order
    #[derive(Default)]
    struct RecordingRuntime {
        local_images: Vec<String>,
        fail_create: bool,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        fn events(&self) -> EventStream {
            futures::stream::empty().boxed()
        }

        async fn inspect(&self, id: &str) -> Result<InstanceDescriptor, RuntimeError> {
            self.record(format!("inspect {}", id));
            Ok(InstanceDescriptor {
                id: id.to_string(),
                name: "/quirky_turing".to_string(),
                network_address: "172.17.0.9".to_string(),
                exposed_ports: vec!["80/tcp".to_string()],
            })
        }

        async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
            self.record(format!("exists {}", reference));
            Ok(self.local_images.iter().any(|i| i == reference))
        }

        async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
            self.record(format!("pull {}", reference));
            Ok(())
        }

        async fn create_instance(&self, reference: &str) -> Result<String, RuntimeError> {
            self.record(format!("create {}", reference));
            if self.fail_create {
                return Err(RuntimeError::NotFound(reference.to_string()));
            }
            Ok("c42".to_string())
        }

        async fn start_instance(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(format!("start {}", id));
            Ok(())
        }
    }

    fn request(json: &str) -> ProvisionRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_tag_defaults_to_latest() {
        assert_eq!(request(r#"{"image":"nginx"}"#).reference(), "nginx:latest");
        assert_eq!(request(r#"{"image":"nginx","tag":"1.25"}"#).reference(), "nginx:1.25");
    }

    #[tokio::test]
    async fn test_pulls_missing_image() {
        let runtime = Arc::new(RecordingRuntime::default());
        let provisioner = Provisioner::new(runtime.clone(), "localhost");

        let hostname = provisioner.provision(&request(r#"{"image":"nginx"}"#)).await.unwrap();

        assert_eq!(hostname, "quirky_turing.localhost");
        assert_eq!(
            runtime.calls(),
            vec![
                "exists nginx:latest",
                "pull nginx:latest",
                "create nginx:latest",
                "start c42",
                "inspect c42",
            ]
        );
    }

    #[tokio::test]
    async fn test_skips_pull_for_local_image() {
        let runtime = Arc::new(RecordingRuntime {
            local_images: vec!["nginx:latest".to_string()],
            ..Default::default()
        });
        let provisioner = Provisioner::new(runtime.clone(), "localhost");

        let hostname = provisioner.provision(&request(r#"{"image":"nginx"}"#)).await.unwrap();

        assert_eq!(hostname, "quirky_turing.localhost");
        assert!(!runtime.calls().iter().any(|c| c.starts_with("pull")));
    }

    #[tokio::test]
    async fn test_runtime_failure_stops_provisioning() {
        let runtime = Arc::new(RecordingRuntime {
            fail_create: true,
            ..Default::default()
        });
        let provisioner = Provisioner::new(runtime.clone(), "localhost");

        let err = provisioner.provision(&request(r#"{"image":"nginx"}"#)).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Runtime(_)));
        assert!(!runtime.calls().iter().any(|c| c.starts_with("start")));
    }

    #[tokio::test]
    async fn test_rejects_empty_image() {
        let runtime = Arc::new(RecordingRuntime::default());
        let provisioner = Provisioner::new(runtime.clone(), "localhost");

        let err = provisioner.provision(&request(r#"{"image":" "}"#)).await.unwrap_err();

        assert!(matches!(err, ProvisionError::InvalidRequest(_)));
        assert!(runtime.calls().is_empty());
    }
}
