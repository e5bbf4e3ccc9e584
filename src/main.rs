use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod attempt;
mod config;
mod eeprom;
mod error;
mod influx;
mod monitor;
mod session;
mod ssh;
mod storage;
mod types;

#[cfg(test)]
mod testing;

use attempt::SshPoller;
use config::{Config, LogFormat};
use influx::{InfluxSink, InfluxWriter};
use monitor::{Monitor, MonitorConfig};
use ssh::SshConnector;
use storage::SqliteRepository;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);
    info!("Collector starting with config: {:?}", config);

    let repository = Arc::new(SqliteRepository::open(&config.db_path)?);
    info!("Opened device database.");

    let influx = InfluxWriter::new(Client::new(), config.influx.clone());
    influx
        .health()
        .await
        .context("cannot reach InfluxDB")?;
    let (sink, writer) = InfluxSink::spawn(influx);
    let poller = Arc::new(SshPoller::new(SshConnector, sink, config.ssh_timeout()));

    let monitor = Monitor::new(
        MonitorConfig {
            sleep_time: config.sleep_time(),
            max_concurrency: config.max_concurrency,
        },
        repository,
        poller,
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested, stopping after the current cycle.");
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    });

    let result = monitor.run(cancel).await;

    // Dropping the monitor releases the last sink handle so the writer can drain.
    drop(monitor);
    if let Err(e) = writer.await {
        error!("Influx writer task failed: {}", e);
    }

    result
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
