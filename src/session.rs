//! Remote session contract for one device: credentials, interface discovery
//! and per-interface EEPROM retrieval.
//!
//! The transport sits behind [`Connector`], [`RemoteShell`] and
//! [`ExecChannel`] so the attempt logic can run against `ssh2` in production
//! and against scripted shells in tests. All calls are blocking.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

use crate::eeprom;
use crate::error::{PollError, SessionError};
use crate::types::{Device, InterfaceMeasurement};

pub const SSH_PORT: u16 = 22;
pub const CMD_SHOW_FIBER_INTERFACES: &str = "show-fiber-interfaces";

pub fn show_eeprom_command(interface: &str) -> String {
    format!("show-eeprom {interface}")
}

#[derive(Debug, Clone)]
pub enum Auth {
    Password(SecretString),
    /// Armored private key, already parsed once and known to be unencrypted.
    PrivateKey(SecretString),
}

pub trait Connector: Send + Sync + 'static {
    type Shell: RemoteShell;

    fn connect(
        &self,
        address: &str,
        login: &str,
        auth: &Auth,
        timeout: Duration,
    ) -> Result<Self::Shell, SessionError>;
}

/// An authenticated session able to open exec channels.
pub trait RemoteShell: Send {
    fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, SessionError>;

    fn close(&mut self) -> Result<(), SessionError>;
}

/// A single exec channel. Dropping it releases the channel on the remote side.
pub trait ExecChannel {
    /// Runs `command` and returns stdout and stderr combined.
    fn run(&mut self, command: &str) -> Result<Vec<u8>, SessionError>;
}

/// Borrowed view of a device for one poll attempt.
pub struct RemoteDevice<'a> {
    device: &'a Device,
}

impl<'a> RemoteDevice<'a> {
    pub fn new(device: &'a Device) -> Self {
        RemoteDevice { device }
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    pub fn auth(&self) -> Result<Auth, SessionError> {
        let keyfile = self.device.keyfile.expose_secret();
        if keyfile.is_empty() {
            return Ok(Auth::Password(self.device.password.clone()));
        }

        parse_private_key(keyfile).map(Auth::PrivateKey)
    }

    pub fn connect<C: Connector>(
        &self,
        connector: &C,
        auth: &Auth,
        timeout: Duration,
    ) -> Result<C::Shell, SessionError> {
        connector.connect(&self.device.ip_address, &self.device.login, auth, timeout)
    }

    pub fn list_interfaces(&self, shell: &mut dyn RemoteShell) -> Result<Vec<String>, SessionError> {
        let mut channel = shell.open_channel()?;
        let output = channel.run(CMD_SHOW_FIBER_INTERFACES)?;
        drop(channel);

        let text = String::from_utf8_lossy(&output);
        let mut interfaces: Vec<String> = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        if interfaces.last().is_some_and(|last| last.is_empty()) {
            interfaces.pop();
        }

        debug!(
            device_id = self.device.id,
            interfaces = interfaces.len(),
            "detected interfaces"
        );
        Ok(interfaces)
    }

    /// Reads every interface once. Returns whatever decoded cleanly together
    /// with the failures of the rest.
    pub fn poll_interfaces(
        &self,
        shell: &mut dyn RemoteShell,
        interfaces: &[String],
    ) -> (Vec<InterfaceMeasurement>, Result<(), PollError>) {
        let mut measurements = Vec::with_capacity(interfaces.len());
        let mut errors = PollError::default();

        for interface in interfaces {
            match read_interface(shell, interface) {
                Ok(measurement) => measurements.push(InterfaceMeasurement {
                    interface: interface.clone(),
                    measurement,
                }),
                Err(e) => errors.push(interface, e),
            }
        }

        (measurements, errors.into_result())
    }
}

fn read_interface(
    shell: &mut dyn RemoteShell,
    interface: &str,
) -> Result<crate::types::Measurement, SessionError> {
    let mut channel = shell.open_channel()?;
    let output = channel.run(&show_eeprom_command(interface))?;
    drop(channel);

    Ok(eeprom::decode(&output)?.measurement()?)
}

fn auth_error(reason: impl std::fmt::Display) -> SessionError {
    SessionError::Auth(reason.to_string())
}

fn passphrase_protected() -> SessionError {
    auth_error("passphrase-protected keys are not supported")
}

/// Parses OpenSSH or PEM (PKCS#1, PKCS#8, SEC1) private key material and
/// returns it as text for the transport.
fn parse_private_key(material: &[u8]) -> Result<SecretString, SessionError> {
    let text = std::str::from_utf8(material)
        .map_err(|_| auth_error("key material is not valid UTF-8"))?;
    let text = text.trim();

    let label = text
        .lines()
        .next()
        .and_then(|line| line.trim().strip_prefix("-----BEGIN "))
        .and_then(|rest| rest.strip_suffix("-----"))
        .filter(|label| label.ends_with("PRIVATE KEY"))
        .ok_or_else(|| auth_error("missing private key header"))?;

    match label {
        "OPENSSH PRIVATE KEY" => {
            let key = ssh_key::PrivateKey::from_openssh(text)
                .map_err(|e| auth_error(format!("invalid openssh key: {e}")))?;
            if key.is_encrypted() {
                return Err(passphrase_protected());
            }
        }
        "ENCRYPTED PRIVATE KEY" => return Err(passphrase_protected()),
        "RSA PRIVATE KEY" => {
            let der = pem_body(text, label)?;
            pkcs1::RsaPrivateKey::try_from(der.as_slice())
                .map_err(|e| auth_error(format!("invalid RSA key: {e}")))?;
        }
        "EC PRIVATE KEY" => {
            let der = pem_body(text, label)?;
            sec1::EcPrivateKey::try_from(der.as_slice())
                .map_err(|e| auth_error(format!("invalid EC key: {e}")))?;
        }
        "PRIVATE KEY" => {
            let der = pem_body(text, label)?;
            pkcs8::PrivateKeyInfo::try_from(der.as_slice())
                .map_err(|e| auth_error(format!("invalid PKCS#8 key: {e}")))?;
        }
        other => return Err(auth_error(format!("unsupported key type {other}"))),
    }

    Ok(SecretString::from(format!("{text}\n")))
}

/// Base64 body of a PEM block. Legacy `Proc-Type: 4,ENCRYPTED` headers are rejected.
fn pem_body(text: &str, label: &str) -> Result<Vec<u8>, SessionError> {
    let footer = format!("-----END {label}-----");
    let mut body = String::new();
    let mut terminated = false;

    for line in text.lines().skip(1).map(str::trim).filter(|line| !line.is_empty()) {
        if line == footer {
            terminated = true;
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Proc-Type") && value.contains("ENCRYPTED") {
                return Err(passphrase_protected());
            }
            continue;
        }
        body.push_str(line);
    }
    if !terminated {
        return Err(auth_error(format!("missing END {label} footer")));
    }

    STANDARD
        .decode(body.as_bytes())
        .map_err(|e| auth_error(format!("invalid key body: {e}")))
}
