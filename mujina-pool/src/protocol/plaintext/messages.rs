//! Stratum v1 JSON-RPC messages and their mapping to the internal
//! representation.
//!
//! Stratum predates JSON-RPC 2.0: there is no version field, notifications
//! carry `"id": null`, and errors are `[code, message, data]` arrays. The
//! [`JsonRpcMessage`] envelope matches those conventions directly.

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::{
    CodecError, Decoded, ErrorCode, Inbound, JobNotify, Outbound, RequestId, RolledVersion,
    Submission, VersionRollingRequest,
};

/// JSON-RPC message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        id: Option<u64>,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// Response; both fields are always written, one of them `null`
    Response {
        id: Option<u64>,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Value,
    },
}

impl JsonRpcMessage {
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn error(id: RequestId, code: ErrorCode) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error: error_array(code),
        }
    }

    pub fn id(&self) -> RequestId {
        match self {
            JsonRpcMessage::Request { id, .. } | JsonRpcMessage::Response { id, .. } => *id,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

fn error_array(code: ErrorCode) -> Value {
    json!([code.stratum_code(), code.stratum_message(), null])
}

/// Translate a parsed message from a miner.
pub fn decode(msg: JsonRpcMessage) -> Decoded {
    let (id, method, params) = match msg {
        JsonRpcMessage::Request { id, method, params } => (id, method, params),
        JsonRpcMessage::Response { id, .. } => {
            return Err(CodecError::malformed(id, "unexpected response from miner"));
        }
    };

    let empty = Vec::new();
    let params = match &params {
        Value::Array(items) => items,
        Value::Null => &empty,
        _ => return Err(CodecError::malformed(id, "params must be an array")),
    };

    match method.as_str() {
        "mining.subscribe" => Ok(Inbound::Subscribe {
            id,
            user_agent: params.first().and_then(Value::as_str).map(str::to_owned),
        }),
        "mining.authorize" => {
            let username = params
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::malformed(id, "authorize: missing username"))?;
            Ok(Inbound::Authorize {
                id,
                username: username.to_owned(),
                password: params.get(1).and_then(Value::as_str).map(str::to_owned),
            })
        }
        "mining.configure" => decode_configure(id, params),
        "mining.submit" => decode_submit(id, params),
        "mining.suggest_difficulty" => {
            let difficulty = params
                .first()
                .and_then(Value::as_f64)
                .ok_or_else(|| CodecError::malformed(id, "suggest_difficulty: not a number"))?;
            Ok(Inbound::SuggestDifficulty { id, difficulty })
        }
        other => Err(CodecError::UnsupportedMessageType {
            id,
            kind: other.to_owned(),
        }),
    }
}

// BIP310: params are [[extension names], {extension parameters}].
fn decode_configure(id: RequestId, params: &[Value]) -> Decoded {
    let names = params
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| CodecError::malformed(id, "configure: missing extension list"))?;
    let wants_rolling = names.iter().any(|n| n.as_str() == Some("version-rolling"));
    if !wants_rolling {
        return Ok(Inbound::Configure {
            id,
            version_rolling: None,
        });
    }

    let ext = params.get(1).and_then(Value::as_object);
    let mask = match ext.and_then(|o| o.get("version-rolling.mask")) {
        Some(Value::String(s)) => parse_hex_u32(s)
            .ok_or_else(|| CodecError::malformed(id, "configure: bad version-rolling.mask"))?,
        Some(_) => return Err(CodecError::malformed(id, "configure: bad version-rolling.mask")),
        None => u32::MAX,
    };
    let min_bit_count = ext
        .and_then(|o| o.get("version-rolling.min-bit-count"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    Ok(Inbound::Configure {
        id,
        version_rolling: Some(VersionRollingRequest {
            mask,
            min_bit_count,
        }),
    })
}

// [worker, job_id, extranonce2, ntime, nonce, (version_bits)]
fn decode_submit(id: RequestId, params: &[Value]) -> Decoded {
    if params.len() < 5 {
        return Err(CodecError::malformed(id, "submit: expected at least 5 params"));
    }
    let job_id = u64::from_str_radix(str_param(params, 1, id, "job_id")?, 16)
        .map_err(|_| CodecError::malformed(id, "submit: bad job_id"))?;
    let extranonce2 = hex::decode(str_param(params, 2, id, "extranonce2")?)
        .map_err(|_| CodecError::malformed(id, "submit: bad extranonce2"))?;
    let ntime = parse_hex_u32(str_param(params, 3, id, "ntime")?)
        .ok_or_else(|| CodecError::malformed(id, "submit: bad ntime"))?;
    let nonce = parse_hex_u32(str_param(params, 4, id, "nonce")?)
        .ok_or_else(|| CodecError::malformed(id, "submit: bad nonce"))?;
    let version = match params.get(5) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(RolledVersion::Bits(
            parse_hex_u32(s).ok_or_else(|| CodecError::malformed(id, "submit: bad version"))?,
        )),
        Some(_) => return Err(CodecError::malformed(id, "submit: bad version")),
    };

    Ok(Inbound::Submit {
        id,
        submission: Submission {
            job_id,
            extranonce2,
            ntime,
            nonce,
            version,
        },
    })
}

fn str_param<'a>(
    params: &'a [Value],
    index: usize,
    id: RequestId,
    name: &str,
) -> Result<&'a str, CodecError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::malformed(id, format!("submit: {} not a string", name)))
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 8 {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// Translate an internal message to its Stratum form.
pub fn encode(msg: &Outbound) -> JsonRpcMessage {
    match msg {
        Outbound::SubscribeResult {
            id,
            subscription_id,
            extranonce1,
            extranonce2_size,
        } => JsonRpcMessage::result(
            *id,
            json!([
                [
                    ["mining.set_difficulty", subscription_id],
                    ["mining.notify", subscription_id]
                ],
                extranonce1.to_string(),
                extranonce2_size
            ]),
        ),
        Outbound::AuthorizeResult { id, authorized } => {
            JsonRpcMessage::result(*id, Value::Bool(*authorized))
        }
        Outbound::ConfigureResult {
            id,
            version_rolling_mask,
        } => {
            let result = match version_rolling_mask {
                Some(mask) => json!({
                    "version-rolling": true,
                    "version-rolling.mask": format!("{:08x}", mask),
                }),
                None => json!({ "version-rolling": false }),
            };
            JsonRpcMessage::result(*id, result)
        }
        Outbound::ChannelOpened { id, .. } => JsonRpcMessage::result(*id, Value::Bool(true)),
        Outbound::ChannelRejected { id, code } | Outbound::Error { id, code } => {
            JsonRpcMessage::error(*id, *code)
        }
        Outbound::NotifyJob(job) => JsonRpcMessage::notification("mining.notify", notify_params(job)),
        Outbound::SetDifficulty(difficulty) => {
            JsonRpcMessage::notification("mining.set_difficulty", json!([difficulty.as_f64()]))
        }
        Outbound::SubmitResult { id, result } => match result {
            Ok(()) => JsonRpcMessage::result(*id, Value::Bool(true)),
            Err(code) => JsonRpcMessage::Response {
                id: *id,
                result: Value::Bool(false),
                error: error_array(*code),
            },
        },
        Outbound::TokenAllocated { id, token } => JsonRpcMessage::result(*id, json!(token)),
        Outbound::CommitJobResult { id, result } => match result {
            Ok(token) => JsonRpcMessage::result(*id, json!(token)),
            Err(reason) => JsonRpcMessage::Response {
                id: *id,
                result: Value::Null,
                error: json!([ErrorCode::Other.stratum_code(), reason, null]),
            },
        },
    }
}

fn notify_params(job: &JobNotify) -> Value {
    let branch: Vec<String> = job
        .merkle_branch
        .iter()
        .map(|node| hex::encode(node.as_byte_array()))
        .collect();
    json!([
        format!("{:x}", job.job_id),
        format_block_hash(&job.prev_hash),
        hex::encode(&job.coinbase1),
        hex::encode(&job.coinbase2),
        branch,
        format!("{:08x}", job.version),
        format!("{:08x}", job.bits),
        format!("{:08x}", job.time),
        job.clean
    ])
}

/// Stratum's word-swapped previous-hash encoding: the internal little-endian
/// bytes with each 4-byte word reversed, then hex encoded.
pub fn format_block_hash(hash: &BlockHash) -> String {
    let mut bytes = hash.to_byte_array();
    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }
    hex::encode(bytes)
}

/// Inverse of [`format_block_hash`].
pub fn parse_block_hash(hex_str: &str) -> Option<BlockHash> {
    let mut bytes: [u8; 32] = hex::decode(hex_str).ok()?.try_into().ok()?;
    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }
    Some(BlockHash::from_byte_array(bytes))
}
