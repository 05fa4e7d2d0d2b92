//! Per-identity coinbase construction.
//!
//! The coinbase is split around the extranonce so that every session can be
//! sent its own `coinbase1`/`coinbase2` while rolling only extranonce2:
//!
//! ```text
//! coinbase1: version | 1 input | null prevout | scriptSig len |
//!            BIP34 height push | extranonce push opcode
//!   ...extranonce1 || extranonce2...
//! coinbase2: tag push | sequence | outputs | locktime
//! ```
//!
//! Both halves are the legacy (non-witness) serialization, so
//! `sha256d(coinbase1 || en1 || en2 || coinbase2)` is the txid.

use bitcoin::blockdata::script::Builder;
use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::{Script, TxOut};
use thiserror::Error;

/// Consensus limit on coinbase scriptSig length.
pub const MAX_SCRIPT_SIG_LEN: usize = 100;

const TX_VERSION: i32 = 2;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoinbaseError {
    #[error("coinbase scriptSig would be {0} bytes")]
    ScriptSigTooLong(usize),

    #[error("extranonce of {0} bytes is not a direct push")]
    ExtranonceTooLong(usize),
}

/// The two halves of a coinbase around its extranonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseParts {
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
}

impl CoinbaseParts {
    /// Full legacy serialization with the given extranonces filled in.
    pub fn assemble(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut tx = Vec::with_capacity(
            self.coinbase1.len() + extranonce1.len() + extranonce2.len() + self.coinbase2.len(),
        );
        tx.extend_from_slice(&self.coinbase1);
        tx.extend_from_slice(extranonce1);
        tx.extend_from_slice(extranonce2);
        tx.extend_from_slice(&self.coinbase2);
        tx
    }
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(0x00),
        len @ 1..=75 => {
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len @ 76..=255 => {
            script.push(0x4c);
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len => {
            script.push(0x4d);
            script.extend_from_slice(&(len as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Tag bytes as they appear in the scriptSig.
pub fn tag_bytes(pool_tag: &str, user_tag: Option<&str>) -> Vec<u8> {
    let mut tag = pool_tag.as_bytes().to_vec();
    if let Some(user) = user_tag {
        tag.extend_from_slice(user.as_bytes());
        tag.push(b'/');
    }
    tag
}

/// Build the coinbase halves.
///
/// `outputs` are written in order; the caller includes the reward output and
/// any witness commitment.
pub fn build(
    height: u32,
    extranonce_len: usize,
    tag: &[u8],
    outputs: &[TxOut],
) -> Result<CoinbaseParts, CoinbaseError> {
    if extranonce_len == 0 || extranonce_len > 75 {
        return Err(CoinbaseError::ExtranonceTooLong(extranonce_len));
    }
    let height_push = Builder::new().push_int(height as i64).into_script();
    let mut tag_push = Vec::with_capacity(tag.len() + 2);
    if !tag.is_empty() {
        push_data(&mut tag_push, tag);
    }

    let script_sig_len = height_push.len() + 1 + extranonce_len + tag_push.len();
    if script_sig_len > MAX_SCRIPT_SIG_LEN {
        return Err(CoinbaseError::ScriptSigTooLong(script_sig_len));
    }

    let mut coinbase1 = Vec::with_capacity(64);
    coinbase1.extend_from_slice(&TX_VERSION.to_le_bytes());
    coinbase1.push(1);
    coinbase1.extend_from_slice(&[0u8; 32]);
    coinbase1.extend_from_slice(&u32::MAX.to_le_bytes());
    coinbase1.push(script_sig_len as u8);
    coinbase1.extend_from_slice(height_push.as_bytes());
    coinbase1.push(extranonce_len as u8);

    let mut coinbase2 = Vec::with_capacity(128);
    coinbase2.extend_from_slice(&tag_push);
    coinbase2.extend_from_slice(&u32::MAX.to_le_bytes());
    coinbase2.extend(serialize(&VarInt(outputs.len() as u64)));
    for output in outputs {
        coinbase2.extend(serialize(output));
    }
    coinbase2.extend_from_slice(&0u32.to_le_bytes());

    Ok(CoinbaseParts {
        coinbase1,
        coinbase2,
    })
}

/// The BIP34 height push for `height`, as it prefixes the scriptSig.
pub fn height_push(height: u32) -> Vec<u8> {
    Builder::new()
        .push_int(height as i64)
        .into_script()
        .into_bytes()
}

/// Whether `outputs` pays `script` anything.
pub fn pays_script(outputs: &[TxOut], script: &Script) -> bool {
    outputs
        .iter()
        .any(|o| o.script_pubkey.as_script() == script && o.value.to_sat() > 0)
}
