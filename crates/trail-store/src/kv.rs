use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

pub const AUTH_TOKEN: &str = "auth.token";
pub const AUTH_STATUS: &str = "auth.status";
pub const REGISTRATION_DIGEST: &str = "registration.digest";
pub const LAST_ONLINE_AT: &str = "network.last_online_at";
pub const DEVICE_ID: &str = "device.id";

/// Small JSON-valued settings store for state that must survive restarts.
#[derive(Clone)]
pub struct KvRepo {
    db: Database,
}

impl KvRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
            let mut rows = stmt.query([key])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row.get(0)?;
                    Ok(Some(serde_json::from_str(&raw)?))
                }
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self, value))]
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, raw, now],
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(n > 0)
        })
    }
}
