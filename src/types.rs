use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::{SecretSlice, SecretString};
use std::fmt;

/// Health of a device as of its last poll cycle. Persisted as the integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i8)]
pub enum Status {
    #[default]
    Undefined = -1,
    Ok = 0,
    ErrorSsh = 1,
    ErrorKeyfile = 2,
    Warning = 3,
}

impl Status {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(Status::Undefined),
            0 => Some(Status::Ok),
            1 => Some(Status::ErrorSsh),
            2 => Some(Status::ErrorKeyfile),
            3 => Some(Status::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Undefined => "STATUS UNDEFINED (NEVER CONNECTED)",
            Status::Ok => "STATUS OK",
            Status::ErrorSsh => "SSH SESSION ERROR",
            Status::ErrorKeyfile => "KEYFILE ERROR",
            Status::Warning => "SOME ERRORS OCCURRED",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: u32,
    pub hostname: String,
    pub ip_address: String,
    pub login: String,
    pub password: SecretString,
    /// Private key material. Empty means password authentication.
    pub keyfile: SecretSlice<u8>,
    /// Last successful contact.
    pub connected: DateTime<Utc>,
    pub last_status: Status,
}

impl Device {
    /// Operator-facing status line, e.g. `STATUS OK (last connection: ...)`.
    pub fn status_connected(&self) -> String {
        match self.last_status {
            Status::Undefined => self.last_status.to_string(),
            status => format!(
                "{} (last connection: {})",
                status,
                self.connected.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        }
    }
}

/// One decoded transceiver reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    pub voltage: f64,
    pub tx_power: f64,
    pub rx_power: f64,
    pub osnr: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceMeasurement {
    pub interface: String,
    pub measurement: Measurement,
}
