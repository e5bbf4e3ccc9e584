//! Cycle orchestration: a timed loop that fetches the fleet and fans the
//! devices out to a fixed pool of workers.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::attempt::DevicePoller;
use crate::storage::DeviceRepository;
use crate::types::{Device, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub sleep_time: Duration,
    pub max_concurrency: usize,
}

/// Per-status device counts for one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub statuses: BTreeMap<i8, usize>,
}

impl CycleReport {
    pub fn record(&mut self, status: Status) {
        *self.statuses.entry(status.code()).or_default() += 1;
    }

    pub fn count(&self, status: Status) -> usize {
        self.statuses.get(&status.code()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.statuses.values().sum()
    }

    fn merge(&mut self, other: CycleReport) {
        for (code, count) in other.statuses {
            *self.statuses.entry(code).or_default() += count;
        }
    }
}

pub struct Monitor<R, P> {
    config: MonitorConfig,
    repository: Arc<R>,
    poller: Arc<P>,
}

impl<R: DeviceRepository, P: DevicePoller> Monitor<R, P> {
    pub fn new(config: MonitorConfig, repository: Arc<R>, poller: Arc<P>) -> Self {
        Monitor {
            config,
            repository,
            poller,
        }
    }

    /// Runs cycles until `cancel` fires. Cancellation is observed only between
    /// cycles; a running cycle always completes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            info!("waiting {} seconds", self.config.sleep_time.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(self.config.sleep_time) => {}
                _ = cancel.cancelled() => {}
            }

            if cancel.is_cancelled() {
                info!("monitoring stopped");
                return Ok(());
            }

            let span = info_span!("cycle", cycle_id = %Uuid::new_v4());
            match self.run_cycle().instrument(span).await {
                Ok(report) => debug!(devices = report.total(), "cycle complete"),
                Err(e) => debug!(error = %e, "cycle skipped, retrying after the next sleep"),
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        info!("starting monitoring");

        let devices = match self.repository.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "error while getting devices");
                return Err(e);
            }
        };

        let report = dispatch(
            devices,
            self.config.max_concurrency,
            Arc::clone(&self.poller),
            Arc::clone(&self.repository),
        )
        .await;

        info!(
            devices = report.total(),
            ok = report.count(Status::Ok),
            warning = report.count(Status::Warning),
            error_ssh = report.count(Status::ErrorSsh),
            error_keyfile = report.count(Status::ErrorKeyfile),
            "finished monitoring"
        );
        Ok(report)
    }
}

/// Drains `devices` with exactly `max(max_concurrency, 1)` workers and returns
/// once every worker has finished its last device.
pub async fn dispatch<P, R>(
    devices: Vec<Device>,
    max_concurrency: usize,
    poller: Arc<P>,
    repository: Arc<R>,
) -> CycleReport
where
    P: DevicePoller,
    R: DeviceRepository,
{
    let workers = max_concurrency.max(1);
    let (tx, rx) = mpsc::channel::<Device>(workers);
    let rx = Arc::new(Mutex::new(rx));

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let rx = Arc::clone(&rx);
        let poller = Arc::clone(&poller);
        let repository = Arc::clone(&repository);

        set.spawn(
            async move {
                let mut report = CycleReport::default();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(device) = next else { break };

                    let status = poll_device(&poller, device.clone()).await;
                    report.record(status);
                    update_status(repository.as_ref(), device, status).await;
                }
                report
            }
            .instrument(info_span!("worker", worker)),
        );
    }

    for device in devices {
        if tx.send(device).await.is_err() {
            break;
        }
    }
    drop(tx);

    let mut report = CycleReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(worker_report) => report.merge(worker_report),
            Err(e) => error!(error = %e, "worker task failed"),
        }
    }
    report
}

async fn poll_device<P: DevicePoller>(poller: &Arc<P>, device: Device) -> Status {
    let poller = Arc::clone(poller);
    let device_id = device.id;
    let span = Span::current();

    match tokio::task::spawn_blocking(move || span.in_scope(|| poller.poll(&device))).await {
        Ok(status) => status,
        Err(e) => {
            error!(device_id, error = %e, "poll attempt panicked");
            Status::ErrorSsh
        }
    }
}

/// Writes the attempt's status back. Only `Ok` refreshes the last-contact time.
pub async fn update_status<R: DeviceRepository + ?Sized>(
    repository: &R,
    mut device: Device,
    status: Status,
) {
    device.last_status = status;
    if status == Status::Ok {
        device.connected = Utc::now();
    }

    match repository.update_device_status(&device).await {
        Ok(()) => debug!(device_id = device.id, status = %device.status_connected(), "updated device"),
        Err(e) => {
            error!(device_id = device.id, status = %status, error = %e, "error while updating device")
        }
    }
}
