use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where worker caches live on disk
    #[serde(default)]
    pub storage: StorageConfig,

    /// Wallet worker settings
    pub cloud_wallet: CloudWalletConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 8443 when TLS files are configured, set to 0 to disable)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Maximum idle loopback connections kept per worker (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle loopback connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(8443)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            tls_cert: None,
            tls_key: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Server root folder (default: ".")
    #[serde(default = "default_root_folder")]
    pub root_folder: String,

    /// External storage directory, relative to the root folder
    #[serde(default = "default_external_storage")]
    pub external_storage: String,
}

impl StorageConfig {
    /// Directory handed to workers for their local cache
    pub fn cache_container_path(&self) -> PathBuf {
        Path::new(&self.root_folder)
            .join(&self.external_storage)
            .join("cache")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_folder: default_root_folder(),
            external_storage: default_external_storage(),
        }
    }
}

/// Configuration for wallet workers
///
/// # Security Warning
///
/// `runtime` and `boot_script` are executed directly for every wallet that
/// receives traffic. Configuration files must be protected with appropriate
/// file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct CloudWalletConfig {
    /// Boot script run by each worker; relative paths resolve against `install_root`
    pub boot_script: String,

    /// Installation root used to resolve a relative boot script (default: ".")
    #[serde(default = "default_install_root")]
    pub install_root: String,

    /// Interpreter for the boot script, e.g. "node" (default: run the script directly)
    pub runtime: Option<String>,

    /// Arguments placed between the runtime and the boot script
    #[serde(default)]
    pub runtime_args: Vec<String>,

    /// Extra environment variables for workers
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Seconds to wait for a worker to report its port
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout_secs: u64,

    /// Seconds allowed for one forwarded exchange
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Upper bound for buffered request and response bodies
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl CloudWalletConfig {
    pub fn new(boot_script: &str) -> Self {
        Self {
            boot_script: boot_script.to_string(),
            install_root: default_install_root(),
            runtime: None,
            runtime_args: Vec::new(),
            env: HashMap::new(),
            spawn_timeout_secs: default_spawn_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            max_body_bytes: default_max_body_bytes(),
        }
    }

    /// Set the interpreter for the boot script (builder pattern)
    pub fn with_runtime(mut self, runtime: &str, args: Vec<String>) -> Self {
        self.runtime = Some(runtime.to_string());
        self.runtime_args = args;
        self
    }

    /// Absolute or root-relative location of the boot script
    pub fn boot_script_path(&self) -> PathBuf {
        let script = Path::new(&self.boot_script);
        if script.is_relative() {
            Path::new(&self.install_root).join(script)
        } else {
            script.to_path_buf()
        }
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_root_folder() -> String {
    ".".to_string()
}

fn default_external_storage() -> String {
    "external-volume".to_string()
}

fn default_install_root() -> String {
    ".".to_string()
}

fn default_spawn_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
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

        if self.cloud_wallet.boot_script.trim().is_empty() {
            errors.push("cloud_wallet: 'boot_script' must not be empty".to_string());
        }

        if self.cloud_wallet.spawn_timeout_secs == 0 {
            errors.push("cloud_wallet: 'spawn_timeout_secs' must be greater than 0".to_string());
        }

        if self.cloud_wallet.max_body_bytes == 0 {
            errors.push("cloud_wallet: 'max_body_bytes' must be greater than 0".to_string());
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }

        if self.server.http_port() == 0 && self.server.https_port() == 0 {
            errors.push("server: at least one of HTTP or HTTPS must be enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
