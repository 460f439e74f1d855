use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "tallybridge", about = "Tally bridge - stages bank transactions and relays them to the accounting engine")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "tallybridge.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// SQLite database path (overrides config file)
    #[arg(short, long)]
    pub database: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// How many times to try binding the listener before giving up.
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,

    /// Delay before the first bind retry; doubles on each further attempt.
    #[serde(default = "default_bind_backoff_ms")]
    pub bind_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When true, the WebSocket endpoint requires an API key.
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys. The name is the user id the caller acts as.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
    #[serde(default = "default_role")]
    pub role: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub url: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_queue_capacity")]
    pub write_queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_active_company_ttl")]
    pub active_company_ttl_secs: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn active_company_ttl(&self) -> Duration {
        Duration::from_secs(self.active_company_ttl_secs)
    }
}

fn default_role() -> String {
    "reader".to_string()
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
        bind_attempts: default_bind_attempts(),
        bind_backoff_ms: default_bind_backoff_ms(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_bind_attempts() -> u32 {
    5
}

fn default_bind_backoff_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_engine_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_request_timeout() -> u64 {
    10
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Sqlite
}

fn default_db_path() -> String {
    "tallybridge.db".to_string()
}

fn default_queue_capacity() -> usize {
    crate::serializer::DEFAULT_QUEUE_CAPACITY
}

fn default_heartbeat() -> u64 {
    30
}

fn default_active_company_ttl() -> u64 {
    10
}

fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            url: default_engine_url(),
            probe_timeout_secs: default_probe_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: default_backend(),
            path: default_db_path(),
            write_queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            heartbeat_secs: default_heartbeat(),
            active_company_ttl_secs: default_active_company_ttl(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            auth: AuthConfig::default(),
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(ref path) = cli.database {
            config.storage.backend = StorageBackendKind::Sqlite;
            config.storage.path = path.clone();
        }

        config
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            url = "http://127.0.0.1:9999"

            [storage]
            backend = "memory"

            [[auth.api_keys]]
            name = "ana@example.com"
            key = "k1"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.url, "http://127.0.0.1:9999");
        assert_eq!(config.engine.probe_timeout_secs, 3);
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.server.bind_attempts, 5);
        assert_eq!(config.gateway.heartbeat_secs, 30);
        assert_eq!(config.auth.api_keys[0].role, "reader");
    }

    #[test]
    fn cli_overrides_file() {
        let cli = CliArgs {
            config: "/nonexistent/tallybridge.toml".to_string(),
            port: Some(9001),
            log_level: Some("debug".to_string()),
            database: Some("/tmp/staging.db".to_string()),
        };
        let config = Config::load(&cli);
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.path, "/tmp/staging.db");
        assert!(config.listen_addr().is_ok());
    }
}
