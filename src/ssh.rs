//! `ssh2`-backed transport.
//!
//! Host keys are accepted without verification: the handshake result is
//! never compared against a known-hosts store.

use secrecy::ExposeSecret;
use ssh2::{Channel, ExtendedData, Session};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::SessionError;
use crate::session::{Auth, Connector, ExecChannel, RemoteShell, SSH_PORT};

#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Shell = SshShell;

    fn connect(
        &self,
        address: &str,
        login: &str,
        auth: &Auth,
        timeout: Duration,
    ) -> Result<SshShell, SessionError> {
        let endpoint = format!("{address}:{SSH_PORT}");
        let socket_addr = (address, SSH_PORT)
            .to_socket_addrs()
            .map_err(|e| SessionError::connect(&endpoint, e))?
            .next()
            .ok_or_else(|| SessionError::connect(&endpoint, "address did not resolve"))?;

        let tcp = dial(socket_addr, timeout).map_err(|e| SessionError::connect(&endpoint, e))?;

        let mut session = Session::new().map_err(|e| SessionError::connect(&endpoint, e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(session_timeout_ms(timeout));
        session
            .handshake()
            .map_err(|e| SessionError::connect(&endpoint, e))?;

        match auth {
            Auth::Password(password) => session.userauth_password(login, password.expose_secret()),
            Auth::PrivateKey(key) => {
                session.userauth_pubkey_memory(login, None, key.expose_secret(), None)
            }
        }
        .map_err(|e| SessionError::connect(&endpoint, format!("authentication failed: {e}")))?;

        if !session.authenticated() {
            return Err(SessionError::connect(&endpoint, "authentication failed"));
        }

        debug!(endpoint = %endpoint, "created SSH client");
        Ok(SshShell { session })
    }
}

/// A zero `timeout` means no timeout at all.
fn dial(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    if timeout.is_zero() {
        return TcpStream::connect(addr);
    }

    let tcp = TcpStream::connect_timeout(&addr, timeout)?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;
    Ok(tcp)
}

/// libssh2 reads 0 as "wait forever".
fn session_timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

pub struct SshShell {
    session: Session,
}

impl RemoteShell for SshShell {
    fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, SessionError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| SessionError::Session(format!("cannot open channel: {e}")))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| SessionError::Session(format!("cannot merge stderr: {e}")))?;

        Ok(Box::new(SshChannel {
            channel,
            closed: false,
        }))
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.session
            .disconnect(None, "monitoring finished", None)
            .map_err(|e| SessionError::Session(format!("cannot close client connection: {e}")))
    }
}

struct SshChannel {
    channel: Channel,
    closed: bool,
}

impl ExecChannel for SshChannel {
    fn run(&mut self, command: &str) -> Result<Vec<u8>, SessionError> {
        self.channel
            .exec(command)
            .map_err(|e| SessionError::command(command, e))?;

        let mut output = Vec::new();
        self.channel
            .read_to_end(&mut output)
            .map_err(|e| SessionError::command(command, e))?;

        self.channel
            .wait_close()
            .map_err(|e| SessionError::command(command, e))?;
        self.closed = true;

        match self.channel.exit_status() {
            Ok(0) => Ok(output),
            Ok(code) => Err(SessionError::command(
                command,
                format!("exit status {code}: {}", String::from_utf8_lossy(&output).trim()),
            )),
            Err(e) => Err(SessionError::command(command, e)),
        }
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.channel.close().and_then(|_| self.channel.wait_close()) {
            error!(error = %e, "cannot close session");
        }
    }
}
