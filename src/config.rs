use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "collector_config.json";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub sleep_time_secs: u64,
    pub ssh_timeout_secs: u64,
    pub max_concurrency: usize,
    pub db_path: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub influx: InfluxConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub token: SecretString,
    pub org: String,
    pub bucket: String,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sleep_time_secs: 30,
            ssh_timeout_secs: 10,
            max_concurrency: 10,
            db_path: "./devices.db".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            influx: InfluxConfig::default(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        InfluxConfig {
            host: "http://localhost".to_string(),
            port: 8086,
            token: SecretString::from(String::new()),
            org: String::new(),
            bucket: String::new(),
            batch_size: 500,
            flush_interval_secs: 1,
        }
    }
}

impl Config {
    /// Reads `$CONFIG_DIR/collector_config.json` if present, the environment otherwise.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_file_path();
        if path.exists() {
            Self::load_from_file()
        } else {
            Ok(Self::from_env())
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let influx_defaults = InfluxConfig::default();

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Config {
            sleep_time_secs: parse_or(&lookup, "MONITOR_SLEEP_TIME_SECONDS", defaults.sleep_time_secs),
            ssh_timeout_secs: parse_or(&lookup, "MONITOR_SSH_TIMEOUT_SECONDS", defaults.ssh_timeout_secs),
            max_concurrency: parse_or(&lookup, "MONITOR_MAX_CONCURRENCY", defaults.max_concurrency),
            db_path: lookup("DB_PATH").unwrap_or(defaults.db_path),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            influx: InfluxConfig {
                host: lookup("INFLUX_HOST").unwrap_or(influx_defaults.host),
                port: parse_or(&lookup, "INFLUX_PORT", influx_defaults.port),
                token: SecretString::from(lookup("INFLUX_TOKEN").unwrap_or_default()),
                org: lookup("INFLUX_ORG").unwrap_or_default(),
                bucket: lookup("INFLUX_BUCKET").unwrap_or_default(),
                batch_size: parse_or(&lookup, "INFLUX_BATCH_SIZE", influx_defaults.batch_size),
                flush_interval_secs: parse_or(
                    &lookup,
                    "INFLUX_FLUSH_INTERVAL_SECONDS",
                    influx_defaults.flush_interval_secs,
                ),
            },
        }
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join(CONFIG_FILE_NAME)
    }

    pub fn load_from_file() -> Result<Self> {
        let config_file_path = Self::get_config_file_path();
        let contents = fs::read_to_string(&config_file_path)
            .with_context(|| format!("cannot read {}", config_file_path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("cannot parse {}", config_file_path.display()))?;
        Ok(config)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
