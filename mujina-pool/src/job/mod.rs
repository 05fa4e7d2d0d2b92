//! Jobs, coinbase construction, and template negotiation.
//!
//! A [`Job`] is an immutable snapshot of work derived from one block
//! template. Sessions specialize it per identity: the coinbase pays the
//! session's claim script and carries its tag, so every session gets its
//! own `coinbase1`/`coinbase2` around the extranonce.
//!
//! The [`JobManager`] owns the current job, hands out generations from one
//! monotonic counter, polls the upstream template source, and validates
//! miner-negotiated templates.

pub mod coinbase;
mod manager;
pub mod merkle;
mod negotiation;
mod template;

pub use manager::{JobManager, JobParams, JobSnapshot};
pub use negotiation::{NegotiationRequester, RejectReason, TemplateCommitment};
pub use template::{BlockTemplate, ParsedTemplate, TemplateTransaction};

#[cfg(test)]
pub(crate) use template::tests::regtest_template;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bitcoin::block::{Header, Version};
use bitcoin::consensus::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::pow::Target;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, Script, ScriptBuf, Transaction, TxMerkleNode, TxOut,
    Witness,
};
use serde::Serialize;

use crate::protocol::JobNotify;
use coinbase::{CoinbaseError, CoinbaseParts};

/// Longest pool tag accepted in configuration.
pub const MAX_POOL_TAG_LEN: usize = 40;

/// Where a job's template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    /// The pool's upstream template
    Pool,
    /// A template the miner committed with this token
    Negotiated { token: u64 },
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSource::Pool => write!(f, "pool"),
            JobSource::Negotiated { token } => write!(f, "negotiated({:016x})", token),
        }
    }
}

/// Immutable unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    /// Monotonic id shared by pool and negotiated jobs; the wire job id
    pub generation: u64,

    pub source: JobSource,

    pub height: u32,

    pub prev_blockhash: BlockHash,

    /// Block version before any rolling
    pub version: u32,

    pub bits: CompactTarget,

    pub time: u32,

    /// Whether work on earlier jobs is useless (prev-hash changed)
    pub clean: bool,

    /// Subsidy plus fees available to the coinbase
    pub coinbase_value: u64,

    /// Segwit commitment output script, when the block has witness data
    pub witness_commitment: Option<ScriptBuf>,

    /// Non-coinbase transactions, in block order
    pub transactions: Arc<Vec<Transaction>>,

    /// Merkle branch for the coinbase at position 0
    pub merkle_branch: Vec<TxMerkleNode>,

    /// Outputs declared by a negotiating miner. `None` pays the full value
    /// to the session's claim script.
    pub declared_outputs: Option<Vec<TxOut>>,

    pub fee_total: u64,

    pub created_at: SystemTime,
}

impl Job {
    /// Build a pool job from a parsed upstream template.
    pub fn from_template(generation: u64, template: ParsedTemplate, clean: bool) -> Self {
        let txids: Vec<[u8; 32]> = template
            .transactions
            .iter()
            .map(|tx| tx.compute_txid().to_byte_array())
            .collect();
        Self {
            generation,
            source: JobSource::Pool,
            height: template.height,
            prev_blockhash: template.prev_blockhash,
            version: template.version,
            bits: template.bits,
            time: template.time,
            clean,
            coinbase_value: template.coinbase_value,
            witness_commitment: template.witness_commitment,
            merkle_branch: merkle::coinbase_branch(&txids),
            transactions: Arc::new(template.transactions),
            declared_outputs: None,
            fee_total: template.fee_total,
            created_at: SystemTime::now(),
        }
    }

    /// Network target from `bits`.
    pub fn target(&self) -> Target {
        Target::from(self.bits)
    }

    /// Coinbase outputs for a session paying `claim_script`.
    pub fn coinbase_outputs(&self, claim_script: &Script) -> Vec<TxOut> {
        let mut outputs = match &self.declared_outputs {
            Some(declared) => declared.clone(),
            None => vec![TxOut {
                value: Amount::from_sat(self.coinbase_value),
                script_pubkey: claim_script.to_owned(),
            }],
        };
        if let Some(commitment) = &self.witness_commitment {
            if !outputs.iter().any(|o| &o.script_pubkey == commitment) {
                outputs.push(TxOut {
                    value: Amount::ZERO,
                    script_pubkey: commitment.clone(),
                });
            }
        }
        outputs
    }

    /// Coinbase halves for one session.
    pub fn coinbase_parts(
        &self,
        claim_script: &Script,
        tag: &[u8],
        extranonce_len: usize,
    ) -> Result<CoinbaseParts, CoinbaseError> {
        coinbase::build(
            self.height,
            extranonce_len,
            tag,
            &self.coinbase_outputs(claim_script),
        )
    }

    /// Work notification carrying a session's coinbase parts.
    pub fn notify(&self, parts: &CoinbaseParts, clean: bool) -> JobNotify {
        JobNotify {
            job_id: self.generation,
            prev_hash: self.prev_blockhash,
            coinbase1: parts.coinbase1.clone(),
            coinbase2: parts.coinbase2.clone(),
            merkle_branch: self.merkle_branch.clone(),
            version: self.version,
            bits: self.bits.to_consensus(),
            time: self.time,
            clean,
        }
    }

    /// Block header for a share on this job.
    pub fn header(&self, merkle_root: TxMerkleNode, version: u32, time: u32, nonce: u32) -> Header {
        Header {
            version: Version::from_consensus(version as i32),
            prev_blockhash: self.prev_blockhash,
            merkle_root,
            time,
            bits: self.bits,
            nonce,
        }
    }

    /// Complete block from a solving header and its legacy-serialized
    /// coinbase.
    pub fn assemble_block(
        &self,
        header: Header,
        coinbase: &[u8],
    ) -> Result<Block, bitcoin::consensus::encode::Error> {
        let mut coinbase: Transaction = deserialize(coinbase)?;
        if self.witness_commitment.is_some() {
            coinbase.input[0].witness = Witness::from_slice(&[[0u8; 32]]);
        }
        let mut txdata = Vec::with_capacity(self.transactions.len() + 1);
        txdata.push(coinbase);
        txdata.extend(self.transactions.iter().cloned());
        Ok(Block { header, txdata })
    }
}
