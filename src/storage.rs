use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use secrecy::{SecretSlice, SecretString};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::types::{Device, Status};

/// Device inventory as seen by the collector: a full read per cycle and a
/// status write per device.
#[async_trait]
pub trait DeviceRepository: Send + Sync + 'static {
    async fn devices(&self) -> Result<Vec<Device>>;

    /// Persists only `last_status` and `connected`.
    async fn update_device_status(&self, device: &Device) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        info!("Initializing device database at {}", path.display());
        init(&conn)?;
        Ok(SqliteRepository {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow!("device database lock poisoned"))?;
            f(&conn)
        })
        .await?
    }
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY,
            hostname TEXT NOT NULL,
            ip TEXT NOT NULL,
            login TEXT NOT NULL,
            passwd TEXT,
            keyfile TEXT,
            connected TEXT NOT NULL,
            last_status INTEGER NOT NULL DEFAULT -1
        )",
        [],
    )?;
    Ok(())
}

#[async_trait]
impl DeviceRepository for SqliteRepository {
    async fn devices(&self) -> Result<Vec<Device>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, hostname, ip, login, passwd, keyfile, connected, last_status FROM devices ORDER BY id",
            )?;

            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, DateTime<Utc>>(6)?,
                    row.get::<_, i8>(7)?,
                ))
            })?;

            let mut devices = Vec::new();
            for row in rows {
                let (id, hostname, ip_address, login, passwd, keyfile, connected, code) = row?;

                let password = decode_credential(id, "password", passwd.as_deref());
                let keyfile = decode_credential(id, "keyfile", keyfile.as_deref());
                let last_status = Status::from_code(code).unwrap_or_else(|| {
                    warn!(device_id = id, code, "unknown status code in database");
                    Status::Undefined
                });

                devices.push(Device {
                    id,
                    hostname,
                    ip_address,
                    login,
                    password: SecretString::from(String::from_utf8_lossy(&password).into_owned()),
                    keyfile: SecretSlice::from(keyfile),
                    connected,
                    last_status,
                });
            }
            Ok(devices)
        })
        .await
    }

    async fn update_device_status(&self, device: &Device) -> Result<()> {
        let (id, connected, code) = (device.id, device.connected, device.last_status.code());
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE devices SET connected = ?1, last_status = ?2 WHERE id = ?3",
                params![connected, code, id],
            )?;
            if updated == 0 {
                return Err(anyhow!("device {id} not found"));
            }
            Ok(())
        })
        .await
    }
}

// Credentials are stored base64-encoded; an undecodable value degrades to empty.
fn decode_credential(device_id: u32, column: &str, value: Option<&str>) -> Vec<u8> {
    let Some(value) = value else {
        return Vec::new();
    };
    STANDARD.decode(value).unwrap_or_else(|e| {
        error!(device_id, column, error = %e, "cannot decode credential");
        Vec::new()
    })
}
