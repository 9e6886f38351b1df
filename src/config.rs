use crate::discovery::DiscoveryOptions;
use crate::pool::PoolConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "subdock.toml";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend forwarding settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Container runtime settings
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Proxy port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address for the management API (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub admin_bind: String,

    /// Port for the management API (default: 8080)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for provisioning and route listing.
    /// If not set those endpoints are open.
    pub admin_token: Option<String>,
}

impl ServerConfig {
    pub fn proxy_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr(&self.bind, self.port)
    }

    pub fn admin_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr(&self.admin_bind, self.admin_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Backend connect timeout in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Max time for a backend to answer in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ProxySettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Daemon address; falls back to DOCKER_HOST and the local socket
    pub host: Option<String>,

    /// Suffix appended to container names in provisioning responses
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,

    /// Remove a route when its container dies (default: true)
    #[serde(default = "default_true")]
    pub deregister_on_stop: bool,
}

impl DockerConfig {
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            deregister_on_stop: self.deregister_on_stop,
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            domain_suffix: default_domain_suffix(),
            deregister_on_stop: true,
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8080
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for backend to respond
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_domain_suffix() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

fn parse_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: std::net::IpAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", bind, e))?;
    Ok(SocketAddr::new(ip, port))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `subdock.toml` when present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.admin_port == 0 {
            errors.push("server.admin_port must be non-zero".to_string());
        }

        match (self.server.proxy_addr(), self.server.admin_addr()) {
            (Ok(proxy), Ok(admin)) => {
                let overlapping_ip = proxy.ip() == admin.ip()
                    || proxy.ip().is_unspecified()
                    || admin.ip().is_unspecified();
                if proxy.port() == admin.port() && overlapping_ip {
                    errors.push(format!(
                        "proxy listener {} and admin listener {} collide",
                        proxy, admin
                    ));
                }
            }
            (proxy, admin) => {
                if let Err(e) = proxy {
                    errors.push(format!("server.bind: {}", e));
                }
                if let Err(e) = admin {
                    errors.push(format!("server.admin_bind: {}", e));
                }
            }
        }

        if self.proxy.connect_timeout_ms == 0 {
            errors.push("proxy.connect_timeout_ms must be non-zero".to_string());
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be non-zero".to_string());
        }
        if self.docker.domain_suffix.trim().is_empty() {
            errors.push("docker.domain_suffix must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8000
bind = "127.0.0.1"
admin_port = 9000
admin_token = "s3cret"

[proxy]
connect_timeout_ms = 250
request_timeout_secs = 10

[docker]
host = "tcp://10.0.0.2:2375"
domain_suffix = "apps.internal"
deregister_on_stop = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.proxy.pool_config().connect_timeout, Duration::from_millis(250));
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.pool_max_idle_per_host, 10);
        assert_eq!(config.docker.host.as_deref(), Some("tcp://10.0.0.2:2375"));
        assert_eq!(config.docker.domain_suffix, "apps.internal");
        assert!(!config.docker.discovery_options().deregister_on_stop);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.admin_port, 8080);
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.proxy.connect_timeout_ms, 5000);
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.proxy.pool_idle_timeout_secs, 90);
        assert_eq!(config.docker.domain_suffix, "localhost");
        assert!(config.docker.deregister_on_stop);
        config.validate().unwrap();
    }

    #[test]
    fn test_listener_collision_rejected() {
        let mut config = Config::default();
        config.server.admin_port = config.server.port;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("collide"));

        config.server.bind = "127.0.0.1".to_string();
        config.server.admin_bind = "127.0.0.2".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let toml = r#"
[server]
port = 0

[proxy]
request_timeout_secs = 0

[docker]
domain_suffix = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("request_timeout_secs"));
        assert!(err.contains("domain_suffix"));
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = Config::default();
        config.server.bind = "not-an-ip".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("server.bind"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8081\n\n[docker]\ndomain_suffix = \"test\"").unwrap();

        let config = Config::load_or_default(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.docker.domain_suffix, "test");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proxy]\nconnect_timeout_ms = 0").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
