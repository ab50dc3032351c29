use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// API key shipped as the default; startup warns when it is still in use
pub const INSECURE_DEFAULT_API_KEY: &str = "THE_DEFAULT_IS_NOT_SECURE";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and frontend configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Route table persistence and reaping
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Container runtime used to tear down backends
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Every proxied request path must start with this prefix
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Name of the session cookie matched against route secrets
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Shared secret for the /api endpoint, passed as `?api_key=`
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max seconds to wait for backend response headers (0 disables)
    #[serde(default)]
    pub request_timeout_secs: u64,

    /// Max seconds a WebSocket tunnel may sit without reading a byte (0 disables)
    #[serde(default)]
    pub tunnel_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutesConfig {
    /// Route store used to survive restarts
    #[serde(default = "default_storage")]
    pub storage: PathBuf,

    /// Seconds a route may go without traffic before it is reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds between reaper sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Kill containers on route removal (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Docker endpoint, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`.
    /// Falls back to DOCKER_HOST, then common socket paths.
    pub host: Option<String>,
}

impl ServerConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        (self.tunnel_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.tunnel_idle_timeout_secs))
    }
}

impl RoutesConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            path_prefix: default_path_prefix(),
            cookie_name: default_cookie_name(),
            api_key: default_api_key(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: 0,
            tunnel_idle_timeout_secs: 0,
        }
    }
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: None,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_path_prefix() -> String {
    "/galaxy/gie_proxy".to_string()
}

fn default_cookie_name() -> String {
    "galaxysession".to_string()
}

fn default_api_key() -> String {
    INSECURE_DEFAULT_API_KEY.to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_storage() -> PathBuf {
    PathBuf::from("./sessionMap.json")
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.cookie_name.is_empty() {
            errors.push("server.cookie_name must not be empty".to_string());
        }
        if self.server.api_key.is_empty() {
            errors.push("server.api_key must not be empty".to_string());
        }
        if self.routes.idle_timeout_secs == 0 {
            errors.push("routes.idle_timeout_secs must be greater than 0".to_string());
        }
        if self.routes.sweep_interval_secs == 0 {
            errors.push("routes.sweep_interval_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.server.api_key == INSECURE_DEFAULT_API_KEY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 9090
path_prefix = "/gxproxy"
cookie_name = "sid"
api_key = "supersecret"
request_timeout_secs = 15

[routes]
storage = "/var/lib/sessiongate/routes.json"
idle_timeout_secs = 300
sweep_interval_secs = 5

[docker]
host = "tcp://127.0.0.1:2375"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.path_prefix, "/gxproxy");
        assert_eq!(config.server.cookie_name, "sid");
        assert_eq!(config.server.request_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.server.tunnel_idle_timeout(), None);
        assert_eq!(config.routes.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.routes.sweep_interval(), Duration::from_secs(5));
        assert!(config.docker.enabled);
        assert_eq!(config.docker.host.as_deref(), Some("tcp://127.0.0.1:2375"));
        assert!(config.validate().is_ok());
        assert!(!config.uses_default_api_key());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.path_prefix, "/galaxy/gie_proxy");
        assert_eq!(config.server.cookie_name, "galaxysession");
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.server.pool_idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.routes.storage, PathBuf::from("./sessionMap.json"));
        assert_eq!(config.routes.idle_timeout_secs, 60);
        assert_eq!(config.routes.sweep_interval_secs, 10);
        assert!(config.uses_default_api_key());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.docker.enabled);
        assert!(config.docker.host.is_none());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[server]
port = 0
cookie_name = ""

[routes]
sweep_interval_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("server.cookie_name"));
        assert!(err.contains("routes.sweep_interval_secs"));
        assert!(!err.contains("routes.idle_timeout_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[docker]\nenabled = false\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.docker.enabled);
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
