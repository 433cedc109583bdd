use crate::error::AppResult;
use config::{
    builder::{ConfigBuilder, DefaultState},
    Config, Environment, File,
};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// HTTP server and token issuance settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable origin used to build one-time links
    pub base_url: String,
    /// Lifetime of human-scoped tokens in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// When set, the issuance routes move to their own listener
    #[serde(default)]
    pub admin_port: Option<u16>,
    #[serde(default = "default_admin_host")]
    pub admin_host: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Upper bound on waiting for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://kuze.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

/// Which secret store backs `Set`/`Get`
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackend {
    /// Process memory only, lost on restart
    #[default]
    Memory,
    /// ChaCha20-Poly1305 sealed rows in the database
    Sealed,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecretsConfig {
    #[serde(default)]
    pub backend: SecretBackend,
    /// Base64 encoded 32-byte key, required for the sealed backend
    #[serde(default)]
    pub master_key: Option<String>,
}

/// Chat webhook notifications
#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    5
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PruneConfig {
    /// Defaults to the human token TTL
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub prune: PruneConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> AppResult<Self> {
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name("config/local").required(false))
                // e.g., KUZE_SERVER__BASE_URL, KUZE_DATABASE__URL
                .add_source(
                    Environment::with_prefix("KUZE")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> AppResult<Self> {
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Initialize the global config singleton
    pub fn init() -> AppResult<&'static Self> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config, if initialized
    pub fn get() -> Option<&'static Self> {
        CONFIG.get()
    }

    pub fn prune_interval(&self) -> Duration {
        self.prune
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.server.ttl())
    }
}

impl ServerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn admin_bind_addr(&self) -> Option<String> {
        self.admin_port
            .map(|port| format!("{}:{}", self.admin_host, port))
    }
}
