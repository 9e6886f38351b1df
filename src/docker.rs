//! Docker Engine implementation of the container runtime interface

use crate::runtime::{ContainerRuntime, EventStream, InstanceDescriptor, RuntimeError, RuntimeEvent};
use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, InspectContainerOptions, StartContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum, HostConfig};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Container runtime backed by a Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.contains("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd, set DOCKER_HOST, or configure docker.host",
                e
            )
        })
    }
}

/// Translate an Engine event into the runtime-neutral form
fn decode_event(message: EventMessage) -> Result<RuntimeEvent, RuntimeError> {
    let kind = match message.typ {
        Some(EventMessageTypeEnum::CONTAINER) => "container".to_string(),
        Some(other) => format!("{:?}", other).to_lowercase(),
        None => return Err(RuntimeError::MalformedEvent("event without type".into())),
    };
    let action = message
        .action
        .ok_or_else(|| RuntimeError::MalformedEvent("event without action".into()))?;
    let actor = message
        .actor
        .ok_or_else(|| RuntimeError::MalformedEvent("event without actor".into()))?;
    let id = actor
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RuntimeError::MalformedEvent("event without actor id".into()))?;
    let name = actor.attributes.and_then(|mut attrs| attrs.remove("name"));

    Ok(RuntimeEvent {
        kind,
        action,
        id,
        name,
    })
}

fn describe(id: &str, info: ContainerInspectResponse) -> InstanceDescriptor {
    let network_address = info
        .network_settings
        .as_ref()
        .and_then(|settings| {
            settings
                .ip_address
                .clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| {
                    // user-defined networks leave the top-level address empty
                    settings.networks.as_ref().and_then(|networks| {
                        let mut names: Vec<&String> = networks.keys().collect();
                        names.sort();
                        names.into_iter().find_map(|n| {
                            networks[n].ip_address.clone().filter(|ip| !ip.is_empty())
                        })
                    })
                })
        })
        .unwrap_or_default();

    // The Engine writes ExposedPorts with its keys sorted as strings. The
    // HashMap drops that order, so restore it before the first TCP port is picked.
    let mut exposed_ports: Vec<String> = info
        .config
        .and_then(|config| config.exposed_ports)
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    InstanceDescriptor {
        id: info.id.unwrap_or_else(|| id.to_string()),
        name: info.name.unwrap_or_default(),
        network_address,
        exposed_ports,
    }
}

type MessageStream = BoxStream<'static, Result<EventMessage, bollard::errors::Error>>;

fn api_error(e: bollard::errors::Error) -> RuntimeError {
    RuntimeError::Api(e.to_string())
}

/// A record that failed to decode. bollard's line decoder ends the stream
/// after one of these, so the feed has to be reopened.
fn is_decode_error(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::JsonDataError { .. } | bollard::errors::Error::JsonSerdeError { .. }
    )
}

/// Docker `since` value (`seconds.nanoseconds`) for a Unix time in nanoseconds
fn since_value(time_nano: i64) -> String {
    format!("{}.{:09}", time_nano / 1_000_000_000, time_nano % 1_000_000_000)
}

fn unix_now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Identity of a delivered event, used to drop its replay after reopening
#[derive(Debug, Clone, PartialEq, Eq)]
struct EventMark {
    time_nano: i64,
    id: String,
    action: String,
}

impl EventMark {
    fn of(message: &EventMessage) -> Option<Self> {
        let time_nano = message
            .time_nano
            .or_else(|| message.time.map(|secs| secs * 1_000_000_000))?;
        Some(Self {
            time_nano,
            id: message.actor.as_ref()?.id.clone()?,
            action: message.action.clone()?,
        })
    }
}

/// Container event subscription that survives undecodable records.
///
/// After a decode error the subscription is reopened with `since` set to the
/// last delivered event, which the daemon replays and this feed drops. If no
/// event got through since the last reopen, the bad record would be replayed
/// too, so the feed restarts from the current time instead.
struct EventFeed {
    client: Docker,
    inner: Option<MessageStream>,
    since: Option<String>,
    last: Option<EventMark>,
    progressed: bool,
    done: bool,
}

impl EventFeed {
    fn new(client: Docker) -> Self {
        Self {
            client,
            inner: None,
            since: None,
            last: None,
            progressed: false,
            done: false,
        }
    }

    fn subscribe(&self) -> MessageStream {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            since: self.since.clone(),
            filters,
            ..Default::default()
        };
        debug!(since = ?self.since, "Subscribing to Docker events");
        self.client.events(Some(options)).boxed()
    }

    async fn next_event(&mut self) -> Option<Result<RuntimeEvent, RuntimeError>> {
        loop {
            if self.done {
                return None;
            }
            if self.inner.is_none() {
                self.inner = Some(self.subscribe());
            }
            let inner = self.inner.as_mut()?;

            match inner.next().await {
                Some(Ok(message)) => {
                    let mark = EventMark::of(&message);
                    if mark.is_some() && mark == self.last {
                        continue;
                    }
                    if mark.is_some() {
                        self.last = mark;
                    }
                    self.progressed = true;
                    return Some(decode_event(message));
                }
                Some(Err(e)) if is_decode_error(&e) => {
                    self.since = match (&self.last, self.progressed) {
                        (Some(last), true) => Some(since_value(last.time_nano)),
                        _ => Some(since_value(unix_now_nanos())),
                    };
                    self.progressed = false;
                    self.inner = None;
                    warn!(error = %e, since = ?self.since, "Undecodable Docker event, reopening subscription");
                    return Some(Err(RuntimeError::MalformedEvent(e.to_string())));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(RuntimeError::Subscription(e.to_string())));
                }
                None => return None,
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn events(&self) -> EventStream {
        let feed = EventFeed::new(self.client.clone());
        futures::stream::unfold(feed, |mut feed| async move {
            let item = feed.next_event().await?;
            Some((item, feed))
        })
        .boxed()
    }

    async fn inspect(&self, id: &str) -> Result<InstanceDescriptor, RuntimeError> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(describe(id, info)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match self.client.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        info!(image = reference, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.map_err(|e| RuntimeError::Pull {
                image: reference.to_string(),
                message: e.to_string(),
            })?;
            if let Some(error) = progress.error {
                return Err(RuntimeError::Pull {
                    image: reference.to_string(),
                    message: error,
                });
            }
            if let Some(status) = progress.status {
                debug!(image = reference, status, "Pull progress");
            }
        }

        info!(image = reference, "Image pulled successfully");
        Ok(())
    }

    async fn create_instance(&self, reference: &str) -> Result<String, RuntimeError> {
        let config = Config {
            image: Some(reference.to_string()),
            tty: Some(false),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(api_error)?;
        info!(image = reference, container_id = %response.id, "Created Docker container");
        Ok(response.id)
    }

    async fn start_instance(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(api_error)?;
        info!(container_id = id, "Started Docker container");
        Ok(())
    }
}
