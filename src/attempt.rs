//! One bounded poll attempt against a single device.
//!
//! The attempt walks `Authenticating → Connecting → Listing → Polling` and
//! ends in a [`Status`]. Polling failures retry on the same session until
//! [`FAILED_RUNS_LIMIT`] batches have failed; earlier phases never retry.

use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::influx::MetricsSink;
use crate::session::{Auth, Connector, RemoteDevice, RemoteShell};
use crate::types::{Device, Status};

pub const FAILED_RUNS_LIMIT: u32 = 5;

/// Produces the status of one device for the current cycle. Blocking.
pub trait DevicePoller: Send + Sync + 'static {
    fn poll(&self, device: &Device) -> Status;
}

pub struct SshPoller<C, M> {
    connector: C,
    sink: M,
    timeout: Duration,
}

enum Phase<S: RemoteShell> {
    Authenticating,
    Connecting(Auth),
    Listing(ShellGuard<S>),
    Polling {
        shell: ShellGuard<S>,
        interfaces: Vec<String>,
        failed_runs: u32,
    },
    Finished(Status),
}

/// Closes the session when dropped.
struct ShellGuard<S: RemoteShell> {
    shell: S,
    device_id: u32,
}

impl<S: RemoteShell> Deref for ShellGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.shell
    }
}

impl<S: RemoteShell> DerefMut for ShellGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.shell
    }
}

impl<S: RemoteShell> Drop for ShellGuard<S> {
    fn drop(&mut self) {
        if let Err(e) = self.shell.close() {
            error!(device_id = self.device_id, error = %e, "cannot close client connection");
        }
    }
}

fn status_after(failed_runs: u32) -> Status {
    match failed_runs {
        0 => Status::Ok,
        n if n >= FAILED_RUNS_LIMIT => Status::ErrorSsh,
        _ => Status::Warning,
    }
}

impl<C: Connector, M: MetricsSink> SshPoller<C, M> {
    pub fn new(connector: C, sink: M, timeout: Duration) -> Self {
        SshPoller {
            connector,
            sink,
            timeout,
        }
    }

    fn step(&self, remote: &RemoteDevice<'_>, phase: Phase<C::Shell>) -> Phase<C::Shell> {
        let device = remote.device();

        match phase {
            Phase::Authenticating => match remote.auth() {
                Ok(auth) => Phase::Connecting(auth),
                Err(e) => {
                    error!(device_id = device.id, error = %e, "cannot parse key");
                    Phase::Finished(Status::ErrorKeyfile)
                }
            },
            Phase::Connecting(auth) => match remote.connect(&self.connector, &auth, self.timeout) {
                Ok(shell) => Phase::Listing(ShellGuard {
                    shell,
                    device_id: device.id,
                }),
                Err(e) => {
                    error!(device_id = device.id, error = %e, "SSH client error");
                    Phase::Finished(Status::ErrorSsh)
                }
            },
            Phase::Listing(mut shell) => match remote.list_interfaces(&mut *shell) {
                Ok(interfaces) => Phase::Polling {
                    shell,
                    interfaces,
                    failed_runs: 0,
                },
                Err(e) => {
                    error!(device_id = device.id, error = %e, "error with getting interfaces");
                    Phase::Finished(Status::ErrorSsh)
                }
            },
            Phase::Polling {
                shell,
                failed_runs,
                ..
            } if failed_runs >= FAILED_RUNS_LIMIT => {
                drop(shell);
                warn!(device_id = device.id, "monitoring failed (error limit exceeded)");
                Phase::Finished(status_after(failed_runs))
            }
            Phase::Polling {
                mut shell,
                interfaces,
                failed_runs,
            } => {
                let (measurements, result) = remote.poll_interfaces(&mut *shell, &interfaces);
                match result {
                    Ok(()) => {
                        drop(shell);
                        for m in &measurements {
                            self.sink
                                .insert_measurements(&device.hostname, &m.interface, &m.measurement);
                        }
                        debug!(
                            device_id = device.id,
                            measurements = measurements.len(),
                            failed_runs,
                            "emitted measurements"
                        );
                        Phase::Finished(status_after(failed_runs))
                    }
                    Err(e) => {
                        warn!(
                            device_id = device.id,
                            attempt = failed_runs + 1,
                            discarded = measurements.len(),
                            error = %e,
                            "monitoring error"
                        );
                        Phase::Polling {
                            shell,
                            interfaces,
                            failed_runs: failed_runs + 1,
                        }
                    }
                }
            }
            finished @ Phase::Finished(_) => finished,
        }
    }
}

impl<C: Connector, M: MetricsSink> DevicePoller for SshPoller<C, M> {
    fn poll(&self, device: &Device) -> Status {
        info!(device_id = device.id, hostname = %device.hostname, "started device monitoring");

        let remote = RemoteDevice::new(device);
        let mut phase = Phase::Authenticating;
        loop {
            phase = self.step(&remote, phase);
            if let Phase::Finished(status) = phase {
                return status;
            }
        }
    }
}
