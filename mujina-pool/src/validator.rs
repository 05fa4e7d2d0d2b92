//! Share validation.
//!
//! [`ShareValidator::validate`] recomputes a submitted share's block header
//! and classifies it. It is pure: the caller supplies the job assignment the
//! share names and the session's recent-share set, and records the share's
//! key into that set afterwards.
//!
//! Checks run in this order, first failure wins:
//!
//! 1. The job is one the session was sent and is still live (`StaleJob`).
//! 2. Extranonce2 has the assigned size (`Malformed`).
//! 3. Rolled version bits stay inside the session mask (`InvalidVersion`).
//! 4. The share has not been seen before (`Duplicate`).
//! 5. ntime is not before the job's time nor too far ahead (`TimeOutOfRange`).
//! 6. The header hash meets the network target (`BlockSolve`).
//! 7. The header hash meets the assigned difficulty (`Accept`, otherwise
//!    `BelowDifficulty`).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::block::Header;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::job::coinbase::CoinbaseParts;
use crate::job::{merkle, Job, JobSource};
use crate::protocol::{ErrorCode, RolledVersion, Submission};
use crate::types::{hash_to_difficulty, Difficulty, Extranonce1};

/// What to do with version bits rolled outside the session mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionMaskPolicy {
    /// Reject the share as `InvalidVersion`
    Reject,
    /// Drop the offending bits and validate the rest
    IgnoreRolledBits,
}

#[derive(Debug, Clone)]
pub struct ValidationParams {
    /// How long a superseded job keeps accepting shares
    pub stale_grace: Duration,
    /// Bits the pool lets miners roll
    pub version_mask: u32,
    pub version_mask_policy: VersionMaskPolicy,
    pub extranonce2_size: usize,
    /// Seconds an ntime may run ahead of the job's time
    pub max_ntime_ahead: u32,
    /// Recent shares remembered per session
    pub duplicate_window: usize,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            stale_grace: Duration::from_secs(5),
            version_mask: 0x1fff_e000,
            version_mask_policy: VersionMaskPolicy::Reject,
            extranonce2_size: 8,
            max_ntime_ahead: 7200,
            duplicate_window: 4096,
        }
    }
}

/// A job as sent to one session.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job: Arc<Job>,
    pub coinbase: CoinbaseParts,
    /// Difficulty the session was at when this job was sent
    pub difficulty: Difficulty,
    /// Difficulty before a retarget re-sent this job, and when that happened
    pub prior_difficulty: Option<(Difficulty, Instant)>,
    pub notified_at: Instant,
    /// When a newer job replaced this one
    pub superseded_at: Option<Instant>,
}

impl Assignment {
    pub fn new(job: Arc<Job>, coinbase: CoinbaseParts, difficulty: Difficulty, now: Instant) -> Self {
        Self {
            job,
            coinbase,
            difficulty,
            prior_difficulty: None,
            notified_at: now,
            superseded_at: None,
        }
    }

    /// Difficulty a share must meet at `now`.
    ///
    /// Right after a retarget, shares still in flight at the old difficulty
    /// count for the grace period.
    pub fn effective_difficulty(&self, now: Instant, grace: Duration) -> Difficulty {
        match self.prior_difficulty {
            Some((prior, changed_at))
                if now.saturating_duration_since(changed_at) <= grace && prior < self.difficulty =>
            {
                prior
            }
            _ => self.difficulty,
        }
    }

    pub fn generation(&self) -> u64 {
        self.job.generation
    }
}

/// The jobs a session can still submit against: the current one and the
/// one it replaced.
#[derive(Debug, Default)]
pub struct NotifiedJobs {
    current: Option<Assignment>,
    previous: Option<Assignment>,
}

impl NotifiedJobs {
    /// Record that `assignment` was sent to the miner.
    ///
    /// Re-sending the current job (after a retarget) replaces it in place
    /// and keeps the older difficulty for the grace period.
    pub fn push(&mut self, mut assignment: Assignment, now: Instant) {
        match self.current.take() {
            Some(current) if current.generation() == assignment.generation() => {
                assignment.prior_difficulty = Some((current.difficulty, now));
                self.current = Some(assignment);
            }
            Some(mut current) => {
                current.superseded_at = Some(now);
                self.previous = Some(current);
                self.current = Some(assignment);
            }
            None => self.current = Some(assignment),
        }
    }

    pub fn current(&self) -> Option<&Assignment> {
        self.current.as_ref()
    }

    pub fn find(&self, generation: u64) -> Option<&Assignment> {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .find(|a| a.generation() == generation)
    }
}

/// Identity of a share for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareKey {
    pub generation: u64,
    pub extranonce2: Vec<u8>,
    pub nonce: u32,
    pub ntime: u32,
    pub version: u32,
}

/// Bounded set of a session's recently classified shares.
#[derive(Debug)]
pub struct DuplicateTracker {
    window: usize,
    order: VecDeque<ShareKey>,
    seen: HashSet<ShareKey>,
}

impl DuplicateTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            order: VecDeque::with_capacity(window),
            seen: HashSet::with_capacity(window),
        }
    }

    pub fn contains(&self, key: &ShareKey) -> bool {
        self.seen.contains(key)
    }

    /// Remember `key`, forgetting the oldest entry when full.
    pub fn record(&mut self, key: ShareKey) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-session inputs to validation.
#[derive(Debug, Clone, Copy)]
pub struct ShareContext {
    pub extranonce1: Extranonce1,
    /// Mask granted to this session; zero when version rolling is off
    pub version_mask: u32,
    pub now: Instant,
}

/// A share whose proof of work was checked.
#[derive(Debug, Clone)]
pub struct ShareInfo {
    pub key: ShareKey,
    pub hash: BlockHash,
    pub difficulty: Difficulty,
    /// Difficulty the share had to meet
    pub assigned: Difficulty,
    pub version_rolling: bool,
    pub header: Header,
    /// Legacy-serialized coinbase
    pub coinbase: Vec<u8>,
    pub generation: u64,
    pub source: JobSource,
}

#[derive(Debug, Clone, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Accept(ShareInfo),
    BlockSolve(ShareInfo),
    BelowDifficulty(ShareInfo),
    StaleJob,
    Duplicate,
    InvalidVersion,
    Malformed(&'static str),
    TimeOutOfRange,
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Wire rejection code; `None` for counted shares.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Accept(_) | Outcome::BlockSolve(_) => None,
            Outcome::BelowDifficulty(_) => Some(ErrorCode::LowDifficulty),
            Outcome::StaleJob => Some(ErrorCode::JobNotFound),
            Outcome::Duplicate => Some(ErrorCode::Duplicate),
            Outcome::InvalidVersion => Some(ErrorCode::InvalidVersion),
            Outcome::Malformed(_) => Some(ErrorCode::Malformed),
            Outcome::TimeOutOfRange => Some(ErrorCode::TimeOutOfRange),
        }
    }

    /// The checked share, for outcomes that got as far as hashing.
    pub fn share(&self) -> Option<&ShareInfo> {
        match self {
            Outcome::Accept(info) | Outcome::BlockSolve(info) | Outcome::BelowDifficulty(info) => {
                Some(info)
            }
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accept(_) | Outcome::BlockSolve(_))
    }
}

#[derive(Debug, Clone)]
pub struct ShareValidator {
    params: ValidationParams,
}

impl ShareValidator {
    pub fn new(params: ValidationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ValidationParams {
        &self.params
    }

    /// Classify one submission.
    pub fn validate(
        &self,
        ctx: &ShareContext,
        assignment: Option<&Assignment>,
        submission: &Submission,
        seen: &DuplicateTracker,
    ) -> Outcome {
        let Some(assignment) = assignment else {
            return Outcome::StaleJob;
        };
        if let Some(superseded_at) = assignment.superseded_at {
            if ctx.now.saturating_duration_since(superseded_at) > self.params.stale_grace {
                return Outcome::StaleJob;
            }
        }
        let job = &assignment.job;

        if submission.extranonce2.len() != self.params.extranonce2_size {
            return Outcome::Malformed("extranonce2 size");
        }

        let Some(version) = self.header_version(job.version, ctx.version_mask, submission.version)
        else {
            return Outcome::InvalidVersion;
        };

        let key = ShareKey {
            generation: job.generation,
            extranonce2: submission.extranonce2.clone(),
            nonce: submission.nonce,
            ntime: submission.ntime,
            version,
        };
        if seen.contains(&key) {
            return Outcome::Duplicate;
        }

        let max_ntime = job.time.saturating_add(self.params.max_ntime_ahead);
        if submission.ntime < job.time || submission.ntime > max_ntime {
            return Outcome::TimeOutOfRange;
        }

        let coinbase = assignment
            .coinbase
            .assemble(&ctx.extranonce1.to_bytes(), &submission.extranonce2);
        let txid = sha256d::Hash::hash(&coinbase).to_byte_array();
        let merkle_root = merkle::root_from_branch(txid, &job.merkle_branch);
        let header = job.header(merkle_root, version, submission.ntime, submission.nonce);
        let hash = header.block_hash();

        let assigned = assignment.effective_difficulty(ctx.now, self.params.stale_grace);
        let info = ShareInfo {
            key,
            hash,
            difficulty: hash_to_difficulty(&hash),
            assigned,
            version_rolling: version != job.version,
            header,
            coinbase,
            generation: job.generation,
            source: job.source,
        };

        if job.target().is_met_by(hash) {
            Outcome::BlockSolve(info)
        } else if info.difficulty >= assigned {
            Outcome::Accept(info)
        } else {
            Outcome::BelowDifficulty(info)
        }
    }

    /// Header version for a share, or `None` if its rolled bits are refused.
    fn header_version(&self, job_version: u32, mask: u32, rolled: Option<RolledVersion>) -> Option<u32> {
        let (rolled_bits, outside) = match rolled {
            None => return Some(job_version),
            Some(RolledVersion::Bits(bits)) => (bits, bits & !mask),
            Some(RolledVersion::Full(full)) => (full, (full ^ job_version) & !mask),
        };
        if outside != 0 && self.params.version_mask_policy == VersionMaskPolicy::Reject {
            return None;
        }
        Some((job_version & !mask) | (rolled_bits & mask))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::regtest_template;
    use bitcoin::ScriptBuf;
    use test_case::test_case;

    pub(crate) fn claim_script() -> ScriptBuf {
        ScriptBuf::from_hex("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap()
    }

    fn job_with_bits(bits: &str, generation: u64) -> Arc<Job> {
        let mut template = regtest_template();
        template.bits = bits.into();
        Arc::new(Job::from_template(generation, template.parse().unwrap(), true))
    }

    fn assignment(job: Arc<Job>, difficulty: f64, now: Instant) -> Assignment {
        let parts = job.coinbase_parts(&claim_script(), b"/test/", 12).unwrap();
        Assignment::new(job, parts, Difficulty::new(difficulty).unwrap(), now)
    }

    fn ctx(now: Instant) -> ShareContext {
        ShareContext {
            extranonce1: Extranonce1::from_bytes([0, 0, 0, 1]),
            version_mask: 0x1fff_e000,
            now,
        }
    }

    fn submission(job: &Job, nonce: u32) -> Submission {
        Submission {
            job_id: job.generation,
            extranonce2: vec![0; 8],
            ntime: job.time,
            nonce,
            version: None,
        }
    }

    fn validator() -> ShareValidator {
        ShareValidator::new(ValidationParams::default())
    }

    /// Search nonces until validation gives an outcome of `kind`.
    fn find_nonce(a: &Assignment, kind: &str) -> (u32, Outcome) {
        let v = validator();
        let seen = DuplicateTracker::new(16);
        let now = a.notified_at;
        (0..10_000)
            .map(|n| (n, v.validate(&ctx(now), Some(a), &submission(&a.job, n), &seen)))
            .find(|(_, o)| o.kind() == kind)
            .unwrap()
    }

    #[test]
    fn test_block_solve_on_regtest() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let (_, outcome) = find_nonce(&a, "block_solve");
        let info = outcome.share().unwrap();
        assert!(a.job.target().is_met_by(info.hash));
        assert_eq!(info.source, JobSource::Pool);
        assert!(!info.version_rolling);
    }

    #[test]
    fn test_accept_below_network_target() {
        let now = Instant::now();
        let a = assignment(job_with_bits("1d00ffff", 1), 1e-12, now);
        let (_, outcome) = find_nonce(&a, "accept");
        let info = outcome.share().unwrap();
        assert!(info.difficulty >= info.assigned);
        assert!(outcome.is_accepted());
        assert_eq!(outcome.error_code(), None);
    }

    #[test]
    fn test_below_difficulty() {
        let now = Instant::now();
        let a = assignment(job_with_bits("1d00ffff", 1), 1e12, now);
        let (_, outcome) = find_nonce(&a, "below_difficulty");
        assert_eq!(outcome.error_code(), Some(ErrorCode::LowDifficulty));
    }

    #[test]
    fn test_recomputed_hash_matches_header() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let (nonce, outcome) = find_nonce(&a, "block_solve");
        let info = outcome.share().unwrap();
        assert_eq!(info.header.nonce, nonce);
        assert_eq!(info.header.block_hash(), info.hash);
        let block = a.job.assemble_block(info.header, &info.coinbase).unwrap();
        assert_eq!(block.compute_merkle_root(), Some(info.header.merkle_root));
    }

    #[test]
    fn test_unknown_job_is_stale() {
        let now = Instant::now();
        let job = job_with_bits("207fffff", 1);
        let outcome = validator().validate(
            &ctx(now),
            None,
            &submission(&job, 0),
            &DuplicateTracker::new(16),
        );
        assert!(matches!(outcome, Outcome::StaleJob));
        assert_eq!(outcome.error_code(), Some(ErrorCode::JobNotFound));
    }

    #[test]
    fn test_stale_grace_window() {
        let start = Instant::now();
        let old = job_with_bits("207fffff", 1);
        let mut jobs = NotifiedJobs::default();
        jobs.push(assignment(old.clone(), 1e-12, start), start);
        jobs.push(assignment(job_with_bits("207fffff", 2), 1e-12, start), start);

        let seen = DuplicateTracker::new(16);
        let within = start + Duration::from_secs(5);
        let outcome = validator().validate(&ctx(within), jobs.find(1), &submission(&old, 0), &seen);
        assert!(!matches!(outcome, Outcome::StaleJob));

        let after = start + Duration::from_millis(5001);
        let outcome = validator().validate(&ctx(after), jobs.find(1), &submission(&old, 0), &seen);
        assert!(matches!(outcome, Outcome::StaleJob));
    }

    #[test]
    fn test_only_one_generation_back() {
        let now = Instant::now();
        let mut jobs = NotifiedJobs::default();
        for generation in 1..=3 {
            jobs.push(assignment(job_with_bits("207fffff", generation), 1.0, now), now);
        }
        assert!(jobs.find(1).is_none());
        assert!(jobs.find(2).is_some());
        assert_eq!(jobs.current().unwrap().generation(), 3);
    }

    #[test]
    fn test_renotify_keeps_prior_difficulty_for_grace() {
        let start = Instant::now();
        let job = job_with_bits("207fffff", 1);
        let mut jobs = NotifiedJobs::default();
        jobs.push(assignment(job.clone(), 1.0, start), start);
        jobs.push(assignment(job, 8.0, start), start);

        let current = jobs.current().unwrap();
        let grace = Duration::from_secs(5);
        assert_eq!(current.effective_difficulty(start, grace).as_f64(), 1.0);
        assert_eq!(
            current
                .effective_difficulty(start + Duration::from_secs(6), grace)
                .as_f64(),
            8.0
        );
        assert!(jobs.find(1).unwrap().superseded_at.is_none());
    }

    #[test]
    fn test_wrong_extranonce2_size() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1.0, now);
        let mut sub = submission(&a.job, 0);
        sub.extranonce2 = vec![0; 4];
        let outcome = validator().validate(&ctx(now), Some(&a), &sub, &DuplicateTracker::new(16));
        assert!(matches!(outcome, Outcome::Malformed(_)));
    }

    #[test_case(Some(RolledVersion::Bits(0x0000_2000)), VersionMaskPolicy::Reject, true; "bits inside mask")]
    #[test_case(Some(RolledVersion::Bits(0x0000_0001)), VersionMaskPolicy::Reject, false; "bits outside mask rejected")]
    #[test_case(Some(RolledVersion::Bits(0x0000_0001)), VersionMaskPolicy::IgnoreRolledBits, true; "bits outside mask ignored")]
    #[test_case(Some(RolledVersion::Full(0x2000_4000)), VersionMaskPolicy::Reject, true; "full version inside mask")]
    #[test_case(Some(RolledVersion::Full(0x4000_0000)), VersionMaskPolicy::Reject, false; "full version outside mask")]
    #[test_case(None, VersionMaskPolicy::Reject, true; "no rolling")]
    fn test_version_rolling(rolled: Option<RolledVersion>, policy: VersionMaskPolicy, ok: bool) {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let v = ShareValidator::new(ValidationParams {
            version_mask_policy: policy,
            ..ValidationParams::default()
        });
        let mut sub = submission(&a.job, 0);
        sub.version = rolled;
        let outcome = v.validate(&ctx(now), Some(&a), &sub, &DuplicateTracker::new(16));
        assert_eq!(!matches!(outcome, Outcome::InvalidVersion), ok);
        if let Some(info) = outcome.share() {
            assert_eq!(info.header.version.to_consensus() as u32 & !0x1fff_e000, 0x2000_0000);
        }
    }

    #[test]
    fn test_rolled_bits_set_flag() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let mut sub = submission(&a.job, 0);
        sub.version = Some(RolledVersion::Bits(0x0000_e000));
        let outcome = validator().validate(&ctx(now), Some(&a), &sub, &DuplicateTracker::new(16));
        let info = outcome.share().unwrap();
        assert!(info.version_rolling);
        assert_eq!(info.header.version.to_consensus() as u32, 0x2000_e000);
    }

    #[test]
    fn test_no_mask_rejects_any_rolling() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let mut sub = submission(&a.job, 0);
        sub.version = Some(RolledVersion::Bits(0x0000_2000));
        let mut c = ctx(now);
        c.version_mask = 0;
        let outcome = validator().validate(&c, Some(&a), &sub, &DuplicateTracker::new(16));
        assert!(matches!(outcome, Outcome::InvalidVersion));
    }

    #[test]
    fn test_duplicate_after_record() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let sub = submission(&a.job, 7);
        let mut seen = DuplicateTracker::new(16);
        let first = validator().validate(&ctx(now), Some(&a), &sub, &seen);
        seen.record(first.share().unwrap().key.clone());
        let second = validator().validate(&ctx(now), Some(&a), &sub, &seen);
        assert!(matches!(second, Outcome::Duplicate));
    }

    #[test]
    fn test_ntime_bounds() {
        let now = Instant::now();
        let a = assignment(job_with_bits("207fffff", 1), 1e-12, now);
        let seen = DuplicateTracker::new(16);
        let mut sub = submission(&a.job, 0);

        sub.ntime = a.job.time - 1;
        let outcome = validator().validate(&ctx(now), Some(&a), &sub, &seen);
        assert!(matches!(outcome, Outcome::TimeOutOfRange));

        sub.ntime = a.job.time + 7201;
        let outcome = validator().validate(&ctx(now), Some(&a), &sub, &seen);
        assert!(matches!(outcome, Outcome::TimeOutOfRange));

        sub.ntime = a.job.time + 7200;
        let outcome = validator().validate(&ctx(now), Some(&a), &sub, &seen);
        assert!(outcome.share().is_some());
    }

    #[test]
    fn test_duplicate_tracker_window() {
        let mut seen = DuplicateTracker::new(2);
        let key = |nonce| ShareKey {
            generation: 1,
            extranonce2: vec![],
            nonce,
            ntime: 0,
            version: 0,
        };
        seen.record(key(1));
        seen.record(key(2));
        seen.record(key(2));
        assert_eq!(seen.len(), 2);
        seen.record(key(3));
        assert!(!seen.contains(&key(1)));
        assert!(seen.contains(&key(2)));
        assert!(seen.contains(&key(3)));
    }

    #[test]
    fn test_outcome_kinds() {
        assert_eq!(Outcome::StaleJob.kind(), "stale_job");
        assert_eq!(Outcome::TimeOutOfRange.kind(), "time_out_of_range");
        assert_eq!(Outcome::Malformed("x").kind(), "malformed");
    }
}
