//! `getblocktemplate` results.

use std::str::FromStr;

use bitcoin::consensus::deserialize;
use bitcoin::{BlockHash, CompactTarget, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One transaction entry of a block template.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TemplateTransaction {
    /// Consensus serialization, hex
    pub data: String,
    pub txid: String,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub weight: u64,
}

/// The fields of a BIP22/BIP23 block template this pool uses.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlockTemplate {
    pub version: i32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    /// Compact target, hex
    pub bits: String,
    #[serde(rename = "curtime")]
    pub cur_time: u32,
    pub height: u32,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

/// A template with its fields decoded.
#[derive(Debug, Clone)]
pub struct ParsedTemplate {
    pub version: u32,
    pub prev_blockhash: BlockHash,
    pub bits: CompactTarget,
    pub time: u32,
    pub height: u32,
    pub coinbase_value: u64,
    pub witness_commitment: Option<ScriptBuf>,
    pub transactions: Vec<Transaction>,
    pub fee_total: u64,
    pub weight: u64,
}

fn bad(what: &str, detail: impl std::fmt::Display) -> Error {
    Error::UpstreamUnavailable(format!("template {}: {}", what, detail))
}

impl BlockTemplate {
    pub fn parse(&self) -> Result<ParsedTemplate> {
        let prev_blockhash = BlockHash::from_str(&self.previous_block_hash)
            .map_err(|e| bad("previousblockhash", e))?;
        let bits = u32::from_str_radix(&self.bits, 16).map_err(|e| bad("bits", e))?;
        let witness_commitment = self
            .default_witness_commitment
            .as_deref()
            .map(ScriptBuf::from_hex)
            .transpose()
            .map_err(|e| bad("default_witness_commitment", e))?;

        let mut transactions = Vec::with_capacity(self.transactions.len());
        let mut fee_total = 0u64;
        let mut weight = 0u64;
        for entry in &self.transactions {
            let raw = hex::decode(&entry.data).map_err(|e| bad("transaction", e))?;
            let tx: Transaction = deserialize(&raw).map_err(|e| bad("transaction", e))?;
            fee_total = fee_total.saturating_add(entry.fee);
            weight = weight.saturating_add(tx.weight().to_wu());
            transactions.push(tx);
        }

        Ok(ParsedTemplate {
            version: self.version as u32,
            prev_blockhash,
            bits: CompactTarget::from_consensus(bits),
            time: self.cur_time,
            height: self.height,
            coinbase_value: self.coinbase_value,
            witness_commitment,
            transactions,
            fee_total,
            weight,
        })
    }
}
