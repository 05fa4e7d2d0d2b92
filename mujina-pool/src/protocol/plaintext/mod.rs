//! Stratum v1 over newline-delimited JSON-RPC.
//!
//! Client requests: `mining.subscribe`, `mining.authorize`,
//! `mining.configure` (BIP310 version rolling), `mining.submit`,
//! `mining.suggest_difficulty`. Server notifications: `mining.notify`,
//! `mining.set_difficulty`.

mod codec;
mod messages;

pub use codec::{PlaintextCodec, DEFAULT_MAX_LINE_LENGTH};
pub use messages::{format_block_hash, parse_block_hash, JsonRpcMessage};
