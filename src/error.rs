use std::fmt;
use thiserror::Error;

use crate::eeprom::DecodeError;

/// Failures while talking to a single device.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot parse key: {0}")]
    Auth(String),
    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("session error: {0}")]
    Session(String),
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl SessionError {
    pub fn connect(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        SessionError::Connect {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn command(command: impl Into<String>, reason: impl fmt::Display) -> Self {
        SessionError::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{source} (interface: {interface})")]
pub struct InterfaceFailure {
    pub interface: String,
    #[source]
    pub source: SessionError,
}

/// Every interface that failed during one poll batch.
#[derive(Debug, Default)]
pub struct PollError {
    pub failures: Vec<InterfaceFailure>,
}

impl PollError {
    pub fn push(&mut self, interface: &str, source: SessionError) {
        self.failures.push(InterfaceFailure {
            interface: interface.to_string(),
            source,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<(), PollError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PollError {}
