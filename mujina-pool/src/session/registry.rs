//! Live session bookkeeping.
//!
//! The registry owns the extranonce1 allocator and the session slot limit,
//! and keeps a small per-session record for the monitoring API. Sessions
//! hold a [`SessionHandle`]; dropping it frees the slot and the extranonce1.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use tokio::time::Instant;

use crate::api_client::types::SessionInfo;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::types::{ExtranonceAllocator, Extranonce1};

new_key_type! {
    struct SessionKey;
}

struct Entry {
    id: u64,
    protocol: Protocol,
    peer: String,
    extranonce1: Extranonce1,
    identity: Option<String>,
    difficulty: f64,
    connected_at: Instant,
    submitted: u64,
    accepted: u64,
    rejected: u64,
    best_difficulty: f64,
    version_rolling: bool,
}

struct Inner {
    sessions: SlotMap<SessionKey, Entry>,
    extranonces: ExtranonceAllocator,
}

/// Pool-wide counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub sessions: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub blocks: u64,
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    max_sessions: usize,
    next_id: AtomicU64,
    sessions_total: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    blocks: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: SlotMap::with_key(),
                extranonces: ExtranonceAllocator::new(max_sessions),
            }),
            max_sessions,
            next_id: AtomicU64::new(1),
            sessions_total: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
        }
    }

    /// Claim a session slot and an extranonce1 for a new connection.
    ///
    /// Fails with [`Error::ResourceExhausted`] at `max_sessions` or when the
    /// extranonce space runs out; existing sessions are unaffected.
    pub fn register(self: &Arc<Self>, protocol: Protocol, peer: String) -> Result<SessionHandle> {
        let mut inner = self.inner.lock();
        if inner.sessions.len() >= self.max_sessions {
            return Err(Error::ResourceExhausted(format!(
                "session limit {} reached",
                self.max_sessions
            )));
        }
        let extranonce1 = inner
            .extranonces
            .allocate()
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = inner.sessions.insert(Entry {
            id,
            protocol,
            peer,
            extranonce1,
            identity: None,
            difficulty: 0.0,
            connected_at: Instant::now(),
            submitted: 0,
            accepted: 0,
            rejected: 0,
            best_difficulty: 0.0,
            version_rolling: false,
        });
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        Ok(SessionHandle {
            registry: self.clone(),
            key,
            id,
            extranonce1,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time view of every live session, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock();
        let mut list: Vec<SessionInfo> = inner
            .sessions
            .values()
            .map(|entry| SessionInfo {
                id: entry.id,
                protocol: entry.protocol.to_string(),
                peer: entry.peer.clone(),
                extranonce1: entry.extranonce1.to_string(),
                identity: entry.identity.clone(),
                difficulty: entry.difficulty,
                connected_secs: entry.connected_at.elapsed().as_secs(),
                submitted: entry.submitted,
                accepted: entry.accepted,
                rejected: entry.rejected,
                best_difficulty: entry.best_difficulty,
                version_rolling: entry.version_rolling,
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub fn totals(&self) -> Totals {
        Totals {
            sessions: self.sessions_total.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
        }
    }

    fn update(&self, key: SessionKey, f: impl FnOnce(&mut Entry)) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(key) {
            f(entry);
        }
    }

    fn release(&self, key: SessionKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.sessions.remove(key) {
            inner.extranonces.release(entry.extranonce1);
        }
    }
}

/// A live session's claim on the registry.
pub struct SessionHandle {
    registry: Arc<SessionRegistry>,
    key: SessionKey,
    id: u64,
    extranonce1: Extranonce1,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extranonce1(&self) -> Extranonce1 {
        self.extranonce1
    }

    pub fn set_identity(&self, identity: &str) {
        self.registry
            .update(self.key, |e| e.identity = Some(identity.to_string()));
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.registry.update(self.key, |e| e.difficulty = difficulty);
    }

    /// Count one submission, with the share's difficulty if it was hashed.
    pub fn record_share(&self, accepted: bool, share_difficulty: Option<f64>) {
        let counter = if accepted {
            &self.registry.accepted
        } else {
            &self.registry.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.registry.update(self.key, |e| {
            e.submitted += 1;
            if accepted {
                e.accepted += 1;
            } else {
                e.rejected += 1;
            }
            if let Some(d) = share_difficulty {
                if accepted && d > e.best_difficulty {
                    e.best_difficulty = d;
                }
            }
        });
    }

    pub fn set_version_rolling(&self) {
        self.registry.update(self.key, |e| e.version_rolling = true);
    }

    pub fn record_block(&self) {
        self.registry.blocks.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_distinct_extranonces() {
        let registry = Arc::new(SessionRegistry::new(8));
        let a = registry
            .register(Protocol::Plaintext, "10.0.0.1:1".into())
            .unwrap();
        let b = registry
            .register(Protocol::Encrypted, "10.0.0.2:1".into())
            .unwrap();
        assert_ne!(a.extranonce1(), b.extranonce1());
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_limit_refuses_new_sessions_only() {
        let registry = Arc::new(SessionRegistry::new(1));
        let first = registry
            .register(Protocol::Plaintext, "a".into())
            .unwrap();
        let refused = registry.register(Protocol::Plaintext, "b".into());
        assert!(matches!(refused, Err(Error::ResourceExhausted(_))));

        first.record_share(true, Some(2.0));
        assert_eq!(registry.sessions()[0].accepted, 1);

        drop(first);
        assert!(registry.is_empty());
        assert!(registry.register(Protocol::Plaintext, "c".into()).is_ok());
    }

    #[test]
    fn test_share_counters() {
        let registry = Arc::new(SessionRegistry::new(4));
        let handle = registry
            .register(Protocol::Plaintext, "a".into())
            .unwrap();
        handle.set_identity("addr.rig1");
        handle.set_difficulty(16.0);
        handle.record_share(true, Some(40.0));
        handle.record_share(true, Some(20.0));
        handle.record_share(false, Some(99.0));
        handle.record_share(false, None);
        handle.record_block();
        assert!(!registry.sessions()[0].version_rolling);
        handle.set_version_rolling();

        let info = &registry.sessions()[0];
        assert!(info.version_rolling);
        assert_eq!(info.identity.as_deref(), Some("addr.rig1"));
        assert_eq!(info.difficulty, 16.0);
        assert_eq!((info.submitted, info.accepted, info.rejected), (4, 2, 2));
        assert_eq!(info.best_difficulty, 40.0);

        let totals = registry.totals();
        assert_eq!(totals.accepted, 2);
        assert_eq!(totals.rejected, 2);
        assert_eq!(totals.blocks, 1);
        assert_eq!(totals.sessions, 1);
    }
}
