//! Last-known-stable difficulty per worker, so reconnecting miners skip the
//! ramp. Entries are a cache: they expire after the TTL.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub difficulty: Difficulty,
    /// Unix seconds
    pub saved_at: u64,
}

impl Snapshot {
    fn is_fresh(&self, now: SystemTime, ttl: Duration) -> bool {
        unix_secs(now).saturating_sub(self.saved_at) <= ttl.as_secs()
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub trait SnapshotStore: Send + Sync {
    /// Stable difficulty saved for `worker`, unless expired.
    fn load(&self, worker: &str, now: SystemTime) -> Option<Difficulty>;

    fn save(&self, worker: &str, difficulty: Difficulty, now: SystemTime);
}

pub struct MemoryStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Snapshot>>,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, worker: &str, now: SystemTime) -> Option<Difficulty> {
        let mut entries = self.entries.lock();
        match entries.get(worker) {
            Some(s) if s.is_fresh(now, self.ttl) => Some(s.difficulty),
            Some(_) => {
                entries.remove(worker);
                None
            }
            None => None,
        }
    }

    fn save(&self, worker: &str, difficulty: Difficulty, now: SystemTime) {
        self.entries.lock().insert(
            worker.to_string(),
            Snapshot {
                difficulty,
                saved_at: unix_secs(now),
            },
        );
    }
}

/// Snapshot map kept in a JSON file, rewritten on every save.
///
/// Inside a runtime the file is written on the blocking pool; saves never
/// wait on the disk.
pub struct JsonFileStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Snapshot>>,
    seq: AtomicU64,
    writer: Arc<SnapshotWriter>,
}

/// Writes serialized snapshot maps, newest wins.
struct SnapshotWriter {
    path: PathBuf,
    /// Sequence number of the map on disk
    written: Mutex<u64>,
}

impl SnapshotWriter {
    fn write(&self, seq: u64, json: &[u8]) -> Result<()> {
        let mut written = self.written.lock();
        if seq <= *written {
            return Ok(());
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        *written = seq;
        Ok(())
    }

    fn write_logged(&self, seq: u64, json: &[u8]) {
        if let Err(e) = self.write(seq, json) {
            warn!(path = %self.path.display(), error = %e, "Failed to write vardiff snapshots");
        }
    }
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        let mut entries: HashMap<String, Snapshot> = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable vardiff snapshots");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        let now = SystemTime::now();
        entries.retain(|_, s| s.is_fresh(now, ttl));
        debug!(path = %path.display(), entries = entries.len(), "Loaded vardiff snapshots");
        Ok(Self {
            ttl,
            entries: Mutex::new(entries),
            seq: AtomicU64::new(0),
            writer: Arc::new(SnapshotWriter {
                path: path.to_path_buf(),
                written: Mutex::new(0),
            }),
        })
    }

    fn persist(&self, seq: u64, json: Vec<u8>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let writer = self.writer.clone();
                runtime.spawn_blocking(move || writer.write_logged(seq, &json));
            }
            Err(_) => self.writer.write_logged(seq, &json),
        }
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self, worker: &str, now: SystemTime) -> Option<Difficulty> {
        self.entries
            .lock()
            .get(worker)
            .filter(|s| s.is_fresh(now, self.ttl))
            .map(|s| s.difficulty)
    }

    fn save(&self, worker: &str, difficulty: Difficulty, now: SystemTime) {
        let (seq, json) = {
            let mut entries = self.entries.lock();
            entries.retain(|_, s| s.is_fresh(now, self.ttl));
            entries.insert(
                worker.to_string(),
                Snapshot {
                    difficulty,
                    saved_at: unix_secs(now),
                },
            );
            // Numbered under the lock so a later map always has a larger seq.
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            (seq, serde_json::to_vec_pretty(&*entries))
        };
        match json {
            Ok(json) => self.persist(seq, json),
            Err(e) => warn!(error = %e, "Failed to encode vardiff snapshots"),
        }
    }
}
