//! API data transfer objects.
//!
//! These types define the API contract shared between the server and
//! clients.

use serde::{Deserialize, Serialize};

/// Pool-wide state snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PoolState {
    pub instance: String,
    pub uptime_secs: u64,
    /// Sessions connected right now
    pub sessions: usize,
    /// Sessions accepted since startup
    pub sessions_total: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub blocks_found: u64,
    /// Facts the event queue had to drop.
    pub events_dropped: u64,
    pub tag_cache_entries: usize,
    /// Current pool job, or null before the first template arrives.
    pub job: Option<JobState>,
}

/// The job sessions are currently mining.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JobState {
    pub generation: u64,
    pub height: u32,
    pub prev_hash: String,
    pub tx_count: usize,
    pub fee_total: u64,
    pub coinbase_value: u64,
}

/// One connected miner.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub protocol: String,
    pub peer: String,
    pub extranonce1: String,
    /// `address[.worker]`, or null before authorization.
    pub identity: Option<String>,
    pub difficulty: f64,
    pub connected_secs: u64,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub best_difficulty: f64,
    /// Set once the miner has an accepted share with rolled version bits.
    #[serde(default)]
    pub version_rolling: bool,
}

/// Result of a tag invalidation request.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TagInvalidation {
    pub identity: String,
    /// Whether a cached tag was dropped.
    pub invalidated: bool,
}
