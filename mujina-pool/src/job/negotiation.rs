//! Miner-negotiated templates.
//!
//! A miner first allocates a token, then commits a complete template under
//! it. Validation is structural only: the template must build on the
//! current tip with the current bits, have a plausible time, fit in a block,
//! and parse. Which transactions it carries is the miner's business.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::consensus::deserialize;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{BlockHash, CompactTarget, ScriptBuf, Transaction, TxOut};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use super::{coinbase, merkle, Job, JobSource};
use crate::protocol::CommitJobRequest;

/// Why a committed template was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    #[error("token unknown or not owned by this session")]
    UnknownToken,

    #[error("prev-hash is not the current tip")]
    StalePrevHash,

    #[error("bits differ from the current template")]
    BitsMismatch,

    #[error("time too far from now")]
    TimeOutOfRange,

    #[error("block weight over the limit")]
    Oversized,

    #[error("transactions or outputs do not parse")]
    Malformed,

    #[error("coinbase does not pay the required script")]
    MissingPayoutOutput,

    #[error("no current template to build on")]
    NoCurrentTemplate,

    #[error("too many outstanding tokens")]
    TokenLimit,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Who is committing a template.
#[derive(Debug, Clone)]
pub struct NegotiationRequester {
    pub session: u64,
    /// Claim identity, as authorized
    pub identity: String,
    /// Script paid when the miner declares no outputs of its own
    pub claim_script: ScriptBuf,
}

/// An accepted negotiated template.
#[derive(Debug, Clone)]
pub struct TemplateCommitment {
    pub token: u64,
    pub template_hash: [u8; 32],
    pub tx_count: usize,
    pub fee_total: u64,
    pub weight: u64,
    pub submitter: String,
    pub session: u64,
    pub prev_hash: BlockHash,
    pub job: Arc<Job>,
}

/// Limits applied to committed templates.
#[derive(Debug, Clone)]
pub struct NegotiationLimits {
    pub max_time_drift: Duration,
    pub max_block_weight: u64,
    pub required_payout_script: Option<ScriptBuf>,
}

// Header plus a generous coinbase, in weight units.
const HEADER_WEIGHT: u64 = 4 * 80;
const COINBASE_BASE_WEIGHT: u64 = 4 * 150;

const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

#[derive(Default)]
struct StoreInner {
    /// token -> owning session
    tokens: HashMap<u64, u64>,
    commitments: HashMap<u64, Arc<TemplateCommitment>>,
}

/// Tokens and accepted commitments, shared by all sessions.
pub(crate) struct CommitmentStore {
    /// Unspent tokens one session may hold
    max_tokens: usize,
    /// Commitments kept per session; the oldest goes first
    max_commitments: usize,
    inner: RwLock<StoreInner>,
}

impl CommitmentStore {
    pub fn new(max_tokens: usize, max_commitments: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            max_commitments: max_commitments.max(1),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// A fresh token owned by `session`, unless it already holds its limit.
    pub fn allocate(&self, session: u64) -> Result<u64, RejectReason> {
        let mut inner = self.inner.write();
        let held = inner.tokens.values().filter(|owner| **owner == session).count();
        if held >= self.max_tokens {
            return Err(RejectReason::TokenLimit);
        }
        loop {
            let token = OsRng.next_u64();
            if token != 0
                && !inner.tokens.contains_key(&token)
                && !inner.commitments.contains_key(&token)
            {
                inner.tokens.insert(token, session);
                return Ok(token);
            }
        }
    }

    /// Whether `session` holds `token` unspent.
    pub fn owns(&self, token: u64, session: u64) -> bool {
        self.inner.read().tokens.get(&token) == Some(&session)
    }

    /// Consume the token and store an already validated commitment.
    ///
    /// Ownership and the tip are checked again under the write lock, as
    /// either may have changed while validating. `tip` reads the live tip.
    pub fn insert(
        &self,
        commitment: TemplateCommitment,
        tip: impl FnOnce() -> Option<BlockHash>,
    ) -> Result<Arc<TemplateCommitment>, RejectReason> {
        let mut inner = self.inner.write();
        match inner.tokens.get(&commitment.token) {
            Some(&owner) if owner == commitment.session => {}
            _ => return Err(RejectReason::UnknownToken),
        }
        match tip() {
            None => return Err(RejectReason::NoCurrentTemplate),
            Some(tip) if tip != commitment.prev_hash => return Err(RejectReason::StalePrevHash),
            Some(_) => {}
        }
        inner.tokens.remove(&commitment.token);

        let mut held: Vec<(u64, u64)> = inner
            .commitments
            .values()
            .filter(|c| c.session == commitment.session)
            .map(|c| (c.job.generation, c.token))
            .collect();
        if held.len() >= self.max_commitments {
            held.sort_unstable();
            let excess = held.len() + 1 - self.max_commitments;
            for (_, token) in held.into_iter().take(excess) {
                inner.commitments.remove(&token);
            }
        }

        let commitment = Arc::new(commitment);
        inner
            .commitments
            .insert(commitment.token, commitment.clone());
        Ok(commitment)
    }

    pub fn get(&self, token: u64) -> Option<Arc<TemplateCommitment>> {
        self.inner.read().commitments.get(&token).cloned()
    }

    pub fn find_generation(&self, generation: u64) -> Option<Arc<Job>> {
        self.inner
            .read()
            .commitments
            .values()
            .find(|c| c.job.generation == generation)
            .map(|c| c.job.clone())
    }

    /// Drop every commitment not built on `tip`.
    pub fn retain_tip(&self, tip: BlockHash) -> usize {
        let mut inner = self.inner.write();
        let before = inner.commitments.len();
        inner.commitments.retain(|_, c| c.prev_hash == tip);
        before - inner.commitments.len()
    }

    /// Forget everything a departed session held.
    pub fn release_session(&self, session: u64) {
        let mut inner = self.inner.write();
        inner.tokens.retain(|_, owner| *owner != session);
        inner.commitments.retain(|_, c| c.session != session);
    }

    pub fn commitment_count(&self) -> usize {
        self.inner.read().commitments.len()
    }

    pub fn token_count(&self, session: u64) -> usize {
        self.inner
            .read()
            .tokens
            .values()
            .filter(|owner| **owner == session)
            .count()
    }
}

fn unix_secs(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn template_hash(request: &CommitJobRequest) -> [u8; 32] {
    let mut engine = sha256d::Hash::engine();
    engine.input(&request.version.to_le_bytes());
    engine.input(request.prev_hash.as_byte_array());
    engine.input(&request.bits.to_le_bytes());
    engine.input(&request.time.to_le_bytes());
    engine.input(&request.coinbase_value.to_le_bytes());
    for output in &request.coinbase_outputs {
        engine.input(output);
    }
    for tx in &request.transactions {
        engine.input(tx);
    }
    sha256d::Hash::from_engine(engine).to_byte_array()
}

/// Commitment output for transactions carrying witness data, if any do.
fn witness_commitment(transactions: &[Transaction]) -> Option<ScriptBuf> {
    if !transactions.iter().any(|tx| tx.input.iter().any(|i| !i.witness.is_empty())) {
        return None;
    }
    let mut wtxids = Vec::with_capacity(transactions.len() + 1);
    wtxids.push([0u8; 32]);
    wtxids.extend(transactions.iter().map(|tx| tx.compute_wtxid().to_byte_array()));
    let root = merkle::merkle_root(&wtxids);

    let mut engine = sha256d::Hash::engine();
    engine.input(&root);
    engine.input(&[0u8; 32]);
    let commitment = sha256d::Hash::from_engine(engine).to_byte_array();

    let mut script = WITNESS_COMMITMENT_HEADER.to_vec();
    script.extend_from_slice(&commitment);
    Some(ScriptBuf::from_bytes(script))
}

/// Structural validation of `request` against the current tip job.
pub(crate) fn validate(
    request: &CommitJobRequest,
    requester: &NegotiationRequester,
    tip: &Job,
    limits: &NegotiationLimits,
    now: SystemTime,
    generation: u64,
) -> Result<TemplateCommitment, RejectReason> {
    if request.prev_hash != tip.prev_blockhash {
        return Err(RejectReason::StalePrevHash);
    }
    if request.bits != tip.bits.to_consensus() {
        return Err(RejectReason::BitsMismatch);
    }
    let drift = unix_secs(now).abs_diff(request.time as u64);
    if drift > limits.max_time_drift.as_secs() {
        return Err(RejectReason::TimeOutOfRange);
    }

    let transactions = request
        .transactions
        .iter()
        .map(|raw| deserialize::<Transaction>(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| RejectReason::Malformed)?;
    let declared = request
        .coinbase_outputs
        .iter()
        .map(|raw| deserialize::<TxOut>(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| RejectReason::Malformed)?;
    let declared_value = declared
        .iter()
        .try_fold(0u64, |sum, o| sum.checked_add(o.value.to_sat()))
        .ok_or(RejectReason::Malformed)?;
    if declared_value > request.coinbase_value {
        return Err(RejectReason::Malformed);
    }

    let outputs_weight: u64 = request
        .coinbase_outputs
        .iter()
        .map(|o| 4 * o.len() as u64)
        .sum();
    let weight = transactions
        .iter()
        .map(|tx| tx.weight().to_wu())
        .fold(HEADER_WEIGHT + COINBASE_BASE_WEIGHT + outputs_weight, u64::saturating_add);
    if weight > limits.max_block_weight {
        return Err(RejectReason::Oversized);
    }

    let declared_outputs = (!declared.is_empty()).then_some(declared);
    if let Some(required) = &limits.required_payout_script {
        let pays = match &declared_outputs {
            Some(outputs) => coinbase::pays_script(outputs, required),
            None => requester.claim_script.as_script() == required.as_script(),
        };
        if !pays {
            return Err(RejectReason::MissingPayoutOutput);
        }
    }

    let txids: Vec<[u8; 32]> = transactions
        .iter()
        .map(|tx| tx.compute_txid().to_byte_array())
        .collect();
    let job = Job {
        generation,
        source: JobSource::Negotiated {
            token: request.token,
        },
        height: tip.height,
        prev_blockhash: request.prev_hash,
        version: request.version,
        bits: CompactTarget::from_consensus(request.bits),
        time: request.time,
        clean: false,
        coinbase_value: request.coinbase_value,
        witness_commitment: witness_commitment(&transactions),
        merkle_branch: merkle::coinbase_branch(&txids),
        transactions: Arc::new(transactions),
        declared_outputs,
        fee_total: request.fee_total,
        created_at: now,
    };

    Ok(TemplateCommitment {
        token: request.token,
        template_hash: template_hash(request),
        tx_count: request.transactions.len(),
        fee_total: request.fee_total,
        weight,
        submitter: requester.identity.clone(),
        session: requester.session,
        prev_hash: request.prev_hash,
        job: Arc::new(job),
    })
}
