//! Durable store contract and the sled-backed implementation.

use sled::Db;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::cache::WatchEntry;
use crate::error::StoreError;

/// Persists watch entries across restarts.
pub trait DurableStore: Send + Sync + 'static {
    /// Insert or overwrite the entry for `entry.ip`.
    fn put(&self, entry: &WatchEntry) -> Result<(), StoreError>;

    /// Remove the entry for `ip`, if any.
    fn delete(&self, ip: IpAddr) -> Result<(), StoreError>;

    /// Every stored entry.
    fn fetch_all(&self) -> Result<Vec<WatchEntry>, StoreError>;

    /// Flush and stop accepting writes.
    fn close(&self) -> Result<(), StoreError>;
}

/// sled database keyed by the IP's text form, valued by the entry as JSON.
#[derive(Debug)]
pub struct SledStore {
    db: Db,
    closed: AtomicBool,
}

impl SledStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        debug!(path = %path.display(), entries = db.len(), "opened store");
        Ok(Self {
            db,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl DurableStore for SledStore {
    fn put(&self, entry: &WatchEntry) -> Result<(), StoreError> {
        self.check_open()?;
        let value = serde_json::to_vec(entry)?;
        self.db.insert(entry.ip.to_string().as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, ip: IpAddr) -> Result<(), StoreError> {
        self.check_open()?;
        self.db.remove(ip.to_string().as_bytes())?;
        Ok(())
    }

    fn fetch_all(&self) -> Result<Vec<WatchEntry>, StoreError> {
        self.check_open()?;
        let mut entries = Vec::with_capacity(self.db.len());

        for item in self.db.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<WatchEntry>(&value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&key), "dropping undecodable record: {}", e);
                    self.db.remove(&key)?;
                }
            }
        }

        Ok(entries)
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.flush()?;
        debug!("store closed");
        Ok(())
    }
}
