//! Configuration management for Tandem server
//!
//! Settings are layered: `conf/application.yml`, then `tandem.*` environment
//! variables, then command line flags.

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment, File};
use tandem_common::{StoreId, current_timestamp};
use tandem_core::HaSettings;

use crate::startup::{LogRotation, LoggingConfig};

pub const DEFAULT_CONFIG_PATH: &str = "conf/application.yml";
pub const DEFAULT_METRICS_PORT: u16 = 9464;

const SERVER_ID_PROPERTY: &str = "tandem.ha.server-id";
const LOCK_READ_TIMEOUT_PROPERTY: &str = "tandem.ha.lock-read-timeout-ms";
const METRICS_PORT_PROPERTY: &str = "tandem.metrics.port";
const LOG_PATH_PROPERTY: &str = "tandem.logs.path";
const LOG_LEVEL_PROPERTY: &str = "tandem.logs.level";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "tandem-server", version, about = "Standalone replication master")]
pub struct Cli {
    /// Path of the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,
    /// Cluster member id of this master
    #[arg(short = 's', long = "server-id", env = "TANDEM_SERVER_ID")]
    pub server_id: Option<i32>,
    /// How long replicas wait for a lock response, in milliseconds
    #[arg(long = "lock-read-timeout-ms")]
    pub lock_read_timeout_ms: Option<u64>,
    /// Port of the Prometheus scrape endpoint
    #[arg(long = "metrics-port")]
    pub metrics_port: Option<u16>,
    #[arg(long = "log-dir", env = "TANDEM_LOG_DIR")]
    pub log_dir: Option<String>,
    #[arg(long = "log-level", env = "TANDEM_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Load configuration using the process arguments
    pub fn new() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&cli.config).required(false))
            .add_source(
                Environment::with_prefix("tandem")
                    .separator(".")
                    .keep_prefix(true)
                    .try_parsing(true),
            );

        if let Some(v) = cli.server_id {
            builder = builder.set_override(SERVER_ID_PROPERTY, v)?;
        }
        if let Some(v) = cli.lock_read_timeout_ms {
            builder = builder.set_override(LOCK_READ_TIMEOUT_PROPERTY, v)?;
        }
        if let Some(v) = cli.metrics_port {
            builder = builder.set_override(METRICS_PORT_PROPERTY, v)?;
        }
        if let Some(v) = cli.log_dir {
            builder = builder.set_override(LOG_PATH_PROPERTY, v)?;
        }
        if let Some(v) = cli.log_level {
            builder = builder.set_override(LOG_LEVEL_PROPERTY, v)?;
        }

        let config = builder
            .build()
            .with_context(|| format!("Failed to build configuration from {}", cli.config))?;

        Ok(Configuration { config })
    }

    // ========================================================================
    // Replication Configuration
    // ========================================================================

    pub fn ha_settings(&self) -> HaSettings {
        HaSettings::from_config(&self.config)
    }

    /// Identity of the store this master serves
    ///
    /// A zero `tandem.store.creation-time` asks for a freshly generated id.
    pub fn store_id(&self) -> StoreId {
        let version = self.config.get_int("tandem.store.version").unwrap_or(1);
        match self.config.get_int("tandem.store.creation-time") {
            Ok(creation_time) if creation_time > 0 => StoreId::new(
                creation_time,
                self.config.get_int("tandem.store.random-id").unwrap_or(0),
                version,
            ),
            _ => StoreId::new(current_timestamp() as i64, rand::random::<i64>(), version),
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        let log_dir = self
            .config
            .get_string(LOG_PATH_PROPERTY)
            .ok()
            .filter(|v| !v.is_empty());
        let rotation = self
            .config
            .get_string("tandem.logs.rotation")
            .ok()
            .and_then(|v| v.parse::<LogRotation>().ok())
            .unwrap_or(LogRotation::Daily);

        LoggingConfig::from_config(
            log_dir,
            self.config.get_bool("tandem.logs.console").unwrap_or(true),
            self.config.get_bool("tandem.logs.file").unwrap_or(true),
            self.config
                .get_string(LOG_LEVEL_PROPERTY)
                .unwrap_or("info".to_string()),
        )
        .with_rotation(rotation)
    }

    // ========================================================================
    // Metrics Configuration
    // ========================================================================

    pub fn metrics_enabled(&self) -> bool {
        self.config.get_bool("tandem.metrics.enabled").unwrap_or(true)
    }

    pub fn metrics_address(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .config
            .get_string("tandem.metrics.address")
            .unwrap_or("0.0.0.0".to_string())
            .parse()
            .context("Invalid tandem.metrics.address")?;
        let port = self
            .config
            .get_int(METRICS_PORT_PROPERTY)
            .unwrap_or(DEFAULT_METRICS_PORT.into());
        let port = u16::try_from(port).context("Invalid tandem.metrics.port")?;
        Ok(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing::Level;

    use super::*;

    const YAML: &str = r#"
tandem:
  ha:
    server-id: 4
    lock-read-timeout-ms: 8000
    transaction-reap-interval-ms: 250
  store:
    creation-time: 1700000000000
    random-id: 77
    version: 2
  logs:
    path: /var/log/tandem
    level: debug
    console: false
    rotation: hourly
  metrics:
    enabled: false
    address: 127.0.0.1
    port: 9100
"#;

    const MISSING: &str = "/nonexistent/tandem.yml";

    fn write_config(yaml: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.yml");
        std::fs::write(&path, yaml).unwrap();
        let path = path.to_string_lossy().into_owned();
        (dir, path)
    }

    fn cli(config: String) -> Cli {
        Cli {
            config,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let configuration = Configuration::from_cli(cli(MISSING.into())).unwrap();

        assert_eq!(configuration.ha_settings(), HaSettings::default());
        assert!(configuration.metrics_enabled());
        assert_eq!(
            configuration.metrics_address().unwrap(),
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT))
        );
        let logging = configuration.logging_config();
        assert!(logging.console_output);
        assert_eq!(logging.console_level, Level::INFO);
    }

    #[test]
    fn test_file_values() {
        let (_dir, path) = write_config(YAML);
        let configuration = Configuration::from_cli(cli(path)).unwrap();

        let settings = configuration.ha_settings();
        assert_eq!(settings.server_id, 4);
        assert_eq!(settings.conversation_timeout(), Duration::from_secs(13));
        assert_eq!(settings.transaction_reap_interval(), Duration::from_millis(250));
        assert_eq!(configuration.store_id(), StoreId::new(1_700_000_000_000, 77, 2));

        let logging = configuration.logging_config();
        assert_eq!(logging.log_dir.to_string_lossy(), "/var/log/tandem");
        assert!(!logging.console_output);
        assert_eq!(logging.file_level, Level::DEBUG);
        assert!(matches!(logging.rotation, LogRotation::Hourly));

        assert!(!configuration.metrics_enabled());
        assert_eq!(
            configuration.metrics_address().unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9100))
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let (_dir, path) = write_config(YAML);
        let configuration = Configuration::from_cli(Cli {
            config: path,
            server_id: Some(9),
            lock_read_timeout_ms: Some(1_000),
            metrics_port: Some(9200),
            log_dir: Some("/tmp/tandem-logs".into()),
            log_level: Some("warn".into()),
        })
        .unwrap();

        let settings = configuration.ha_settings();
        assert_eq!(settings.server_id, 9);
        assert_eq!(settings.lock_read_timeout(), Duration::from_secs(1));
        assert_eq!(configuration.metrics_address().unwrap().port(), 9200);

        let logging = configuration.logging_config();
        assert_eq!(logging.log_dir.to_string_lossy(), "/tmp/tandem-logs");
        assert_eq!(logging.console_level, Level::WARN);
    }

    #[test]
    fn test_generated_store_id() {
        let configuration = Configuration::from_cli(cli(MISSING.into())).unwrap();

        let store_id = configuration.store_id();
        assert!(store_id.creation_time > 0);
        assert_eq!(store_id.store_version, 1);
    }

    #[test]
    fn test_invalid_metrics_port() {
        let config = Config::builder()
            .set_override(METRICS_PORT_PROPERTY, 70_000)
            .unwrap()
            .build()
            .unwrap();

        let configuration = Configuration { config };
        assert!(configuration.metrics_address().is_err());
    }
}
