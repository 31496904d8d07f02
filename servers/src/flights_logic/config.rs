use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use lib_flights::connections::PostgresOptions;
use lib_flights::live::SchedulerSettings;
use lib_flights::SessionSettings;

const DEFAULT_CONFIG_FILE: &str = "server_flights.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Nearby Flights live-query streaming server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FLIGHTS_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "FLIGHTS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FLIGHTS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FLIGHTS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "POSTGRES_URL", help = "Flights database address, host or host:port.")]
    pub postgres_url: Option<String>,

    #[clap(long, env = "POSTGRES_USER", help = "Flights database user.")]
    pub postgres_user: Option<String>,

    #[clap(long, env = "POSTGRES_PASSWORD", help = "Flights database password.")]
    pub postgres_password: Option<String>,

    #[clap(long, env = "POSTGRES_DB", help = "Flights database name.")]
    pub postgres_db: Option<String>,

    #[clap(long, env = "INTROSPECTION_URL", help = "OAuth2 token introspection endpoint.")]
    pub introspection_url: Option<String>,

    #[clap(long, env = "INTROSPECTION_RETRIES", help = "Retries on transient introspection failures.")]
    pub introspection_retries: Option<u32>,

    #[clap(long, env = "FLIGHTS_DEDUP_WINDOW_SECONDS", help = "Seconds a delivered flight stays suppressed for the same client.")]
    pub dedup_window_seconds: Option<u64>,

    #[clap(long, env = "FLIGHTS_MIN_POLL_INTERVAL_MS", help = "Shortest accepted poll interval in milliseconds.")]
    pub min_poll_interval_ms: Option<u64>,

    #[clap(long, env = "FLIGHTS_MAX_RECV_ERRORS", help = "Consecutive receive errors before a session is ended (0 = unlimited).")]
    pub max_consecutive_recv_errors: Option<u32>,

    #[clap(long, env = "FLIGHTS_RECV_BACKOFF_BASE_MS", help = "Base delay in milliseconds after a receive error.")]
    pub recv_backoff_base_ms: Option<u64>,

    #[clap(long, env = "FLIGHTS_RECV_BACKOFF_MAX_MS", help = "Maximum delay in milliseconds after a receive error.")]
    pub recv_backoff_max_ms: Option<u64>,

    #[clap(long, env = "FLIGHTS_SHUTDOWN_GRACE_SECONDS", help = "Seconds to wait for sessions to finish on shutdown.")]
    pub shutdown_grace_seconds: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            postgres_url: other.postgres_url.or(self.postgres_url),
            postgres_user: other.postgres_user.or(self.postgres_user),
            postgres_password: other.postgres_password.or(self.postgres_password),
            postgres_db: other.postgres_db.or(self.postgres_db),
            introspection_url: other.introspection_url.or(self.introspection_url),
            introspection_retries: other.introspection_retries.or(self.introspection_retries),
            dedup_window_seconds: other.dedup_window_seconds.or(self.dedup_window_seconds),
            min_poll_interval_ms: other.min_poll_interval_ms.or(self.min_poll_interval_ms),
            max_consecutive_recv_errors: other.max_consecutive_recv_errors.or(self.max_consecutive_recv_errors),
            recv_backoff_base_ms: other.recv_backoff_base_ms.or(self.recv_backoff_base_ms),
            recv_backoff_max_ms: other.recv_backoff_max_ms.or(self.recv_backoff_max_ms),
            shutdown_grace_seconds: other.shutdown_grace_seconds.or(self.shutdown_grace_seconds),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            postgres_url: Some("localhost:5432".to_string()),
            postgres_user: Some("admin".to_string()),
            postgres_password: Some("secret".to_string()),
            postgres_db: Some("flights".to_string()),
            introspection_url: Some("http://localhost:4445/oauth2/introspect".to_string()),
            introspection_retries: Some(2),
            dedup_window_seconds: Some(3600),
            min_poll_interval_ms: Some(1000),
            max_consecutive_recv_errors: Some(10),
            recv_backoff_base_ms: Some(100),
            recv_backoff_max_ms: Some(5000),
            shutdown_grace_seconds: Some(10),
            ..Default::default()
        }
    }

    /// Resolves the merged options into the typed settings the server runs with.
    pub fn settings(&self) -> Settings {
        let fallback = Config::defaults().merge(self.clone());

        let millis = |v: Option<u64>| Duration::from_millis(v.unwrap_or_default());
        let seconds = |v: Option<u64>| Duration::from_secs(v.unwrap_or_default());

        let tls = match (&fallback.tls_cert_path, &fallback.tls_key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some(TlsPaths {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };

        Settings {
            port: fallback.port.unwrap_or(8080),
            log_dir: fallback.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: fallback.log_level.unwrap_or_else(|| "info".to_string()),
            postgres: PostgresOptions {
                address: fallback.postgres_url.unwrap_or_default(),
                user: fallback.postgres_user.unwrap_or_default(),
                password: fallback.postgres_password.unwrap_or_default(),
                database: fallback.postgres_db.unwrap_or_default(),
            },
            introspection_url: fallback.introspection_url.unwrap_or_default(),
            introspection_retries: fallback.introspection_retries.unwrap_or_default(),
            session: SessionSettings {
                scheduler: SchedulerSettings {
                    dedup_window: seconds(fallback.dedup_window_seconds),
                    min_poll_interval: millis(fallback.min_poll_interval_ms),
                    ..SchedulerSettings::default()
                },
                max_consecutive_recv_errors: fallback.max_consecutive_recv_errors.unwrap_or_default(),
                recv_backoff_base: millis(fallback.recv_backoff_base_ms),
                recv_backoff_max: millis(fallback.recv_backoff_max_ms),
                ..SessionSettings::default()
            },
            shutdown_grace: seconds(fallback.shutdown_grace_seconds),
            tls,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Typed server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub postgres: PostgresOptions,
    pub introspection_url: String,
    pub introspection_retries: u32,
    pub session: SessionSettings,
    pub shutdown_grace: Duration,
    /// Set only when both files exist.
    pub tls: Option<TlsPaths>,
}

pub fn load_config() -> Config {
    load_config_from(Config::parse())
}

/// Merges defaults, the JSON config file and `cli` (CLI args plus environment), in that order.
pub fn load_config_from(cli: Config) -> Config {
    // 1. Load defaults
    let default_config = Config::defaults();

    // 2. Load from config file (server_flights.conf) if present.
    //    The CLI / environment may point to another file.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = default_config;

    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!("Failed to parse config file: {}. Falling back to other sources.", config_file_path.display());
            }
        } else {
            log::warn!("Failed to read config file: {}. Falling back to other sources.", config_file_path.display());
        }
    } else {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", config_file_path.display());
    }

    // 3. Override with environment variables and CLI arguments
    current_config = current_config.merge(cli);

    // 4. Apply default TLS paths if not already set
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        } else {
            log::warn!("Could not determine home directory for default TLS paths.");
        }
    }

    current_config
}
