//! Metrics sink: InfluxDB v2 line protocol over HTTP.
//!
//! [`InfluxSink`] is a cheap handle that formats points and queues them.
//! The paired [`InfluxWriter`] task batches the queue and posts it to the
//! `/api/v2/write` endpoint, so inserting never blocks a poll attempt.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use secrecy::ExposeSecret;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::InfluxConfig;
use crate::types::Measurement;

/// Cap on lines kept across failed flushes; the oldest are dropped first.
const MAX_BUFFERED_LINES: usize = 50_000;

pub trait MetricsSink: Send + Sync + 'static {
    fn insert_measurements(&self, hostname: &str, interface: &str, measurement: &Measurement);
}

impl<T: MetricsSink> MetricsSink for std::sync::Arc<T> {
    fn insert_measurements(&self, hostname: &str, interface: &str, measurement: &Measurement) {
        (**self).insert_measurements(hostname, interface, measurement)
    }
}

#[derive(Clone)]
pub struct InfluxSink {
    tx: mpsc::UnboundedSender<String>,
}

impl MetricsSink for InfluxSink {
    fn insert_measurements(&self, hostname: &str, interface: &str, measurement: &Measurement) {
        let Some(line) = line_protocol(hostname, interface, measurement, Utc::now()) else {
            warn!(hostname, interface, "measurement has no finite fields, skipping");
            return;
        };
        if self.tx.send(line).is_err() {
            error!(hostname, interface, "influx writer stopped, measurement dropped");
        }
    }
}

impl InfluxSink {
    /// Starts the background writer. The task exits after every sink clone
    /// has been dropped and the remaining lines have been flushed.
    pub fn spawn(writer: InfluxWriter) -> (InfluxSink, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer.run(rx));
        (InfluxSink { tx }, handle)
    }
}

pub struct InfluxWriter {
    client: Client,
    config: InfluxConfig,
    pending: VecDeque<String>,
}

impl InfluxWriter {
    pub fn new(client: Client, config: InfluxConfig) -> Self {
        InfluxWriter {
            client,
            config,
            pending: VecDeque::new(),
        }
    }

    fn base_url(&self) -> String {
        format!("{}:{}", self.config.host.trim_end_matches('/'), self.config.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }

    /// Fails unless the server answers `/health` with a success status.
    pub async fn health(&self) -> Result<()> {
        self.client
            .get(self.health_url())
            .send()
            .await?
            .error_for_status()?;
        info!(url = %self.health_url(), "influx is healthy");
        Ok(())
    }

    fn write_request(&self, body: String) -> RequestBuilder {
        self.client
            .post(format!("{}/api/v2/write", self.base_url()))
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(
                "Authorization",
                format!("Token {}", self.config.token.expose_secret()),
            )
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>) {
        let batch_size = self.config.batch_size.max(1);
        let mut flush_interval =
            tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs.max(1)));

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        self.buffer(line);
                        if self.pending.len() >= batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = flush_interval.tick() => self.flush().await,
            }
        }

        self.flush().await;
        info!(dropped = self.pending.len(), "influx writer stopped");
    }

    fn buffer(&mut self, line: String) {
        if self.pending.len() >= MAX_BUFFERED_LINES {
            self.pending.pop_front();
        }
        self.pending.push_back(line);
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let lines: Vec<String> = self.pending.iter().cloned().collect();
        match self.send(&lines).await {
            Ok(()) => {
                self.pending.drain(..lines.len());
                debug!(points = lines.len(), "wrote points to influx");
            }
            Err(e) => {
                error!(error = %e, points = lines.len(), "failed to write points to influx, keeping them for the next flush");
            }
        }
    }

    async fn send(&self, lines: &[String]) -> Result<()> {
        self.write_request(lines.join("\n"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Renders one point. Fields are rounded to two decimals; non-finite fields
/// are omitted because InfluxDB rejects them. Returns `None` when no field is left.
pub fn line_protocol(
    hostname: &str,
    interface: &str,
    measurement: &Measurement,
    timestamp: DateTime<Utc>,
) -> Option<String> {
    let fields: Vec<String> = [
        ("temp", measurement.temperature),
        ("vcc", measurement.voltage),
        ("tx_pwr", measurement.tx_power),
        ("rx_pwr", measurement.rx_power),
        ("osnr", measurement.osnr),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_finite())
    .map(|(key, value)| format!("{key}={}", round2(value)))
    .collect();

    if fields.is_empty() {
        return None;
    }

    let nanos = timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| timestamp.timestamp_micros().saturating_mul(1000));

    Some(format!(
        "{},iface={} {} {}",
        escape(hostname, &[',', ' ']),
        escape(interface, &[',', '=', ' ']),
        fields.join(","),
        nanos
    ))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
