use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every environment variable that overrides file configuration
pub const ENV_PREFIX: &str = "STACKGATE_";

/// Global configuration for a stackgate run
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Verbose logging for stackgate, the platform CLI and the proxy
    #[serde(default)]
    pub debug: bool,

    /// Backend data platform settings
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Local application server fronted by the proxy
    #[serde(default)]
    pub server: ServerConfig,
}

/// How to drive the backend data platform
#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// Command line of the platform CLI, split with shell quoting rules
    #[serde(default = "default_platform_cli")]
    pub cli: String,

    /// Project directory passed as `--workdir`
    #[serde(default = "default_platform_workdir")]
    pub workdir: PathBuf,

    /// File (relative to `workdir`) whose presence means the project is initialized
    #[serde(default = "default_config_marker")]
    pub config_marker: PathBuf,

    /// Environment variable toggling the CLI's own debug output
    #[serde(default = "default_debug_env")]
    pub debug_env: String,

    /// Container inspection tool used for the starting probe and diagnostics
    #[serde(default = "default_container_tool")]
    pub container_tool: String,

    /// Name of the database container whose presence means the platform is starting
    #[serde(default = "default_db_container")]
    pub db_container: String,

    /// Stop and start the platform even if it is already running
    #[serde(default)]
    pub force_restart: bool,

    /// Maximum time to wait for a platform that is already starting
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness polls while waiting for startup
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Time budget of the "is it starting?" probe
    #[serde(default = "default_starting_probe_timeout")]
    pub starting_probe_timeout_ms: u64,
}

impl PlatformConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn starting_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.starting_probe_timeout_ms)
    }

    /// Absolute-or-relative path of the initialization marker file
    pub fn config_marker_path(&self) -> PathBuf {
        self.workdir.join(&self.config_marker)
    }

    fn validate(&self) -> Result<(), String> {
        match shell_words::split(&self.cli) {
            Ok(words) if !words.is_empty() => {}
            Ok(_) => return Err("platform.cli must not be empty".to_string()),
            Err(e) => return Err(format!("platform.cli '{}' cannot be parsed: {}", self.cli, e)),
        }
        if self.container_tool.trim().is_empty() {
            return Err("platform.container_tool must not be empty".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("platform.poll_interval_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            cli: default_platform_cli(),
            workdir: default_platform_workdir(),
            config_marker: default_config_marker(),
            debug_env: default_debug_env(),
            container_tool: default_container_tool(),
            db_container: default_db_container(),
            force_restart: false,
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_ms: default_poll_interval(),
            starting_probe_timeout_ms: default_starting_probe_timeout(),
        }
    }
}

/// How to render and run the reverse proxy
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Proxy executable
    #[serde(default = "default_proxy_binary")]
    pub binary: String,

    /// Where the rendered configuration is written
    #[serde(default = "default_proxy_config_path")]
    pub config_path: PathBuf,

    /// Config adapter passed to the proxy
    #[serde(default = "default_proxy_adapter")]
    pub adapter: String,

    /// Base domain the route subdomains are built on
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen ports, one listen block each
    #[serde(default = "default_proxy_ports")]
    pub ports: Vec<u16>,

    /// Time between SIGTERM and SIGKILL when stopping the proxy
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ProxyConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.binary.trim().is_empty() {
            return Err("proxy.binary must not be empty".to_string());
        }
        if self.host.trim().is_empty() {
            return Err("proxy.host must not be empty".to_string());
        }
        if self.ports.is_empty() {
            return Err("proxy.ports must list at least one port".to_string());
        }
        if self.ports.contains(&0) {
            return Err("proxy.ports must not contain port 0".to_string());
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: default_proxy_binary(),
            config_path: default_proxy_config_path(),
            adapter: default_proxy_adapter(),
            host: default_host(),
            ports: default_proxy_ports(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// The local application server routes point at
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Path segment of the application API route
    #[serde(default = "default_api_route")]
    pub api_route: String,

    /// Port of the local front-end dev server
    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            api_route: default_api_route(),
            frontend_port: default_frontend_port(),
        }
    }
}

fn default_platform_cli() -> String {
    "supabase".to_string()
}

fn default_platform_workdir() -> PathBuf {
    PathBuf::from("./platform")
}

fn default_config_marker() -> PathBuf {
    PathBuf::from("supabase/config.toml")
}

fn default_debug_env() -> String {
    "SUPABASE_DEBUG".to_string()
}

fn default_container_tool() -> String {
    "docker".to_string()
}

fn default_db_container() -> String {
    "supabase_db_app".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_starting_probe_timeout() -> u64 {
    5000
}

fn default_proxy_binary() -> String {
    "caddy".to_string()
}

fn default_proxy_config_path() -> PathBuf {
    PathBuf::from("./tmp/Caddyfile")
}

fn default_proxy_adapter() -> String {
    "caddyfile".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_proxy_ports() -> Vec<u16> {
    vec![3010]
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_server_port() -> u16 {
    3020
}

fn default_api_route() -> String {
    "bundle-scripts".to_string()
}

fn default_frontend_port() -> u16 {
    3000
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_port(name: &str, value: &str) -> anyhow::Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| anyhow::anyhow!("{}{} must be a port number, got '{}': {}", ENV_PREFIX, name, value, e))
}

impl Config {
    /// Load a TOML configuration file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `STACKGATE_*` variables.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("DEBUG") {
            self.debug = parse_bool(&v);
        }
        if let Some(v) = var("FORCE_RESTART") {
            self.platform.force_restart = parse_bool(&v);
        }
        if let Some(v) = var("PROXY_HOST") {
            self.proxy.host = v;
        }
        if let Some(v) = var("PROXY_PORT") {
            self.proxy.ports = vec![parse_port("PROXY_PORT", &v)?];
        }
        if let Some(v) = var("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = var("SERVER_PORT") {
            self.server.port = parse_port("SERVER_PORT", &v)?;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.platform.validate() {
            errors.push(e);
        }
        if let Err(e) = self.proxy.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
