//! Configuration management for the lock server
//!
//! Settings are layered: the optional `conf/latchkey.yml` file, then
//! `LATCHKEY_*` environment variables (`__` separates nesting, e.g.
//! `LATCHKEY_LOCK__RECALL_TIMEOUT_MS`), then command line overrides.

use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use latchkey_common::DEFAULT_SERVER_PORT;

use crate::error::Result;
use crate::lock::GreedyPolicy;
use crate::lock::greedy::{DEFAULT_PROMOTION_THRESHOLD, DEFAULT_PROMOTION_WINDOW};
use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/latchkey.yml";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_RECALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(30);

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "latchkey-server", version, about = "Latchkey distributed lock server")]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<String>,
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// Configuration file; missing files are ignored
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,
    /// How long a recalled lease holder may take before its lease is reclaimed
    #[arg(long = "recall-timeout-ms")]
    pub recall_timeout_ms: Option<u64>,
    /// Requests a node must make before it is granted a greedy lease
    #[arg(long = "greedy-threshold")]
    pub greedy_threshold: Option<u32>,
}

/// Runtime settings of a [`LockServer`](crate::LockServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Liveness window of a recall
    pub recall_timeout: Duration,
    /// How long a disconnected node's locks are kept for it
    pub reconnect_window: Duration,
    pub greedy: GreedyPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_SERVER_PORT,
            recall_timeout: DEFAULT_RECALL_TIMEOUT,
            reconnect_window: DEFAULT_RECONNECT_WINDOW,
            greedy: GreedyPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_recall_timeout(mut self, recall_timeout: Duration) -> Self {
        self.recall_timeout = recall_timeout;
        self
    }

    pub fn with_reconnect_window(mut self, reconnect_window: Duration) -> Self {
        self.reconnect_window = reconnect_window;
        self
    }

    pub fn with_greedy(mut self, greedy: GreedyPolicy) -> Self {
        self.greedy = greedy;
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Application configuration loaded from config files, environment and CLI
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(args: Cli) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&args.config).required(false))
            .add_source(
                Environment::with_prefix("LATCHKEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = args.bind {
            builder = builder.set_override("server.address", v)?;
        }
        if let Some(v) = args.port {
            builder = builder.set_override("server.port", i64::from(v))?;
        }
        if let Some(v) = args.recall_timeout_ms {
            builder = builder.set_override(
                "lock.recall_timeout_ms",
                i64::try_from(v).unwrap_or(i64::MAX),
            )?;
        }
        if let Some(v) = args.greedy_threshold {
            builder = builder.set_override("lock.greedy.promotion_threshold", i64::from(v))?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    fn get_millis(&self, key: &str, default: Duration) -> Duration {
        self.config
            .get_int(key)
            .map(|v| Duration::from_millis(v.max(0) as u64))
            .unwrap_or(default)
    }

    // ========================================================================
    // Server Configuration
    // ========================================================================

    pub fn server_address(&self) -> String {
        self.config
            .get_string("server.address")
            .unwrap_or(DEFAULT_BIND_ADDRESS.to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.config
            .get_int("server.port")
            .ok()
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    // ========================================================================
    // Lock Configuration
    // ========================================================================

    pub fn recall_timeout(&self) -> Duration {
        self.get_millis("lock.recall_timeout_ms", DEFAULT_RECALL_TIMEOUT)
    }

    pub fn reconnect_window(&self) -> Duration {
        self.get_millis("lock.reconnect_window_ms", DEFAULT_RECONNECT_WINDOW)
    }

    pub fn greedy_policy(&self) -> GreedyPolicy {
        GreedyPolicy {
            enabled: self.config.get_bool("lock.greedy.enabled").unwrap_or(true),
            promotion_threshold: self
                .config
                .get_int("lock.greedy.promotion_threshold")
                .ok()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(DEFAULT_PROMOTION_THRESHOLD),
            window: self.get_millis("lock.greedy.window_ms", DEFAULT_PROMOTION_WINDOW),
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logging.dir").ok(),
            self.config.get_bool("logging.console").unwrap_or(true),
            self.config.get_bool("logging.file").unwrap_or(true),
            self.config
                .get_string("logging.level")
                .unwrap_or("info".to_string()),
        )
    }

    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.server_address(),
            port: self.server_port(),
            recall_timeout: self.recall_timeout(),
            reconnect_window: self.reconnect_window(),
            greedy: self.greedy_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn configuration(args: &[&str]) -> Configuration {
        let mut argv = vec!["latchkey-server"];
        argv.extend_from_slice(args);
        Configuration::from_cli(Cli::try_parse_from(argv).unwrap()).unwrap()
    }

    #[test]
    fn test_defaults_without_config_file() {
        let config = configuration(&["--config", "/nonexistent/latchkey.yml"]).to_server_config();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.recall_timeout, DEFAULT_RECALL_TIMEOUT);
        assert_eq!(config.reconnect_window, DEFAULT_RECONNECT_WINDOW);
        assert_eq!(config.greedy, GreedyPolicy::default());
    }

    #[test]
    fn test_file_and_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  address: 127.0.0.1\n  port: 9500\nlock:\n  recall_timeout_ms: 2500\n  reconnect_window_ms: 0\n  greedy:\n    enabled: false\n    promotion_threshold: 4\n    window_ms: 200\nlogging:\n  level: debug\n  file: false"
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let configuration = configuration(&["--config", &path, "--port", "9600"]);
        let config = configuration.to_server_config();
        assert_eq!(config.listen_addr(), "127.0.0.1:9600");
        assert_eq!(config.recall_timeout, Duration::from_millis(2500));
        assert_eq!(config.reconnect_window, Duration::ZERO);
        assert!(!config.greedy.enabled);
        assert_eq!(config.greedy.promotion_threshold, 4);
        assert_eq!(config.greedy.window, Duration::from_millis(200));

        let logging = configuration.logging_config();
        assert!(!logging.file_logging);
        assert_eq!(logging.console_level, tracing::Level::DEBUG);
    }

    #[test]
    fn test_lock_overrides_from_cli() {
        let config = configuration(&[
            "--config",
            "/nonexistent/latchkey.yml",
            "--recall-timeout-ms",
            "750",
            "--greedy-threshold",
            "3",
            "--bind",
            "10.0.0.1",
        ])
        .to_server_config();
        assert_eq!(config.recall_timeout, Duration::from_millis(750));
        assert_eq!(config.greedy.promotion_threshold, 3);
        assert_eq!(config.bind_address, "10.0.0.1");
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::default()
            .with_bind_address("127.0.0.1")
            .with_port(0)
            .with_greedy(GreedyPolicy::disabled());
        assert_eq!(config.listen_addr(), "127.0.0.1:0");
        assert!(!config.greedy.enabled);
    }
}
