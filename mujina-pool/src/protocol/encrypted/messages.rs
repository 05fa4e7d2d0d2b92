//! Stratum v2 messages to and from the internal representation.
//!
//! A session speaks the mining subprotocol on one extended channel, plus
//! job declaration on the same connection:
//!
//! | Miner sends                          | Becomes                  |
//! |--------------------------------------|--------------------------|
//! | `SetupConnection`                    | [`Inbound::Subscribe`]   |
//! | `OpenExtendedMiningChannel`          | [`Inbound::OpenChannel`] |
//! | `SubmitSharesExtended`               | [`Inbound::Submit`]      |
//! | `AllocateMiningJobToken`             | [`Inbound::AllocateToken`] |
//! | `DeclareMiningJob` (+ transactions)  | [`Inbound::CommitJob`]   |
//! | `CloseChannel`                       | [`Inbound::Disconnect`]  |
//!
//! `DeclareMiningJob.excess_data` carries the rest of the template,
//! consensus encoded: prev hash, bits, time, coinbase value, fee total and
//! the coinbase outputs. When `tx_ids_list` is non-empty the full
//! transactions follow in a `ProvideMissingTransactionsSuccess` with the
//! same request id, and the commit is yielded once both have arrived.

use bitcoin::consensus::encode::{self, Decodable};
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use binary_sv2::{Seq0255, Str0255, Sv2Option, B032, B064K, B0255, U256};
use common_messages_sv2::{SetupConnection, SetupConnectionError, SetupConnectionSuccess};
use job_declaration_sv2::{
    AllocateMiningJobTokenSuccess, DeclareMiningJob, DeclareMiningJobError,
    DeclareMiningJobSuccess, ProvideMissingTransactionsSuccess,
};
use mining_sv2::{
    NewExtendedMiningJob, OpenExtendedMiningChannelSuccess, OpenMiningChannelError,
    SetNewPrevHash, SetTarget, SubmitSharesError, SubmitSharesSuccess,
};
use parsers_sv2::{
    message_type_to_name, AnyMessage, CommonMessages, JobDeclaration, Mining, ParserError,
};

use crate::protocol::{
    CodecError, CommitJobRequest, Decoded, Inbound, Outbound, RequestId, RolledVersion,
    Submission,
};
use crate::tracing::prelude::*;

/// Every message on the wire, owned.
pub type Message = AnyMessage<'static>;

/// Protocol version spoken by this pool.
pub const PROTOCOL_VERSION: u16 = 2;

/// SetupConnection.Success flag: only extended channels are served.
pub const REQUIRES_EXTENDED_CHANNELS: u32 = 1 << 1;

/// Request id of a frame that fails to parse, read from its fixed offset.
fn leading_id(msg_type: u8, payload: &[u8]) -> RequestId {
    let offset = match msg_type {
        mining_sv2::MESSAGE_TYPE_OPEN_EXTENDED_MINING_CHANNEL
        | job_declaration_sv2::MESSAGE_TYPE_DECLARE_MINING_JOB
        | job_declaration_sv2::MESSAGE_TYPE_PROVIDE_MISSING_TRANSACTIONS_SUCCESS => 0,
        mining_sv2::MESSAGE_TYPE_SUBMIT_SHARES_EXTENDED => 4,
        _ => return None,
    };
    payload
        .get(offset..offset + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(|b| u32::from_le_bytes(b) as u64)
}

fn text(s: &Str0255<'_>, id: RequestId) -> Result<String, CodecError> {
    String::from_utf8(s.to_vec()).map_err(|_| CodecError::malformed(id, "string not UTF-8"))
}

fn user_agent(m: &SetupConnection<'_>) -> Option<String> {
    let vendor = String::from_utf8_lossy(m.vendor.inner_as_ref());
    let firmware = String::from_utf8_lossy(m.firmware.inner_as_ref());
    match (vendor.is_empty(), firmware.is_empty()) {
        (true, true) => None,
        (false, true) => Some(vendor.into_owned()),
        (true, false) => Some(firmware.into_owned()),
        (false, false) => Some(format!("{}/{}", vendor, firmware)),
    }
}

/// Template fields carried in `excess_data`. Token, version and
/// transactions are filled in by the caller.
fn declared_template(mut bytes: &[u8]) -> Result<CommitJobRequest, encode::Error> {
    let prev_hash = BlockHash::consensus_decode(&mut bytes)?;
    let bits = u32::consensus_decode(&mut bytes)?;
    let time = u32::consensus_decode(&mut bytes)?;
    let coinbase_value = u64::consensus_decode(&mut bytes)?;
    let fee_total = u64::consensus_decode(&mut bytes)?;
    let coinbase_outputs = Vec::<Vec<u8>>::consensus_decode(&mut bytes)?;
    if !bytes.is_empty() {
        return Err(encode::Error::ParseFailed("trailing bytes"));
    }
    Ok(CommitJobRequest {
        token: 0,
        version: 0,
        prev_hash,
        bits,
        time,
        coinbase_value,
        fee_total,
        coinbase_outputs,
        transactions: Vec::new(),
    })
}

/// A declaration waiting for its transactions.
#[derive(Debug)]
struct PendingDeclaration {
    request_id: u32,
    request: CommitJobRequest,
    tx_count: usize,
}

/// Miner-to-pool decoding.
///
/// Holds at most one declaration between `DeclareMiningJob` and its
/// `ProvideMissingTransactionsSuccess`.
#[derive(Debug, Default)]
pub struct InboundDecoder {
    pending: Option<PendingDeclaration>,
}

impl InboundDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame body. `None` means the frame was absorbed into a
    /// declaration still waiting for its transactions.
    pub fn decode(&mut self, msg_type: u8, payload: &mut [u8]) -> Option<Decoded> {
        let id = leading_id(msg_type, payload);
        let message = match AnyMessage::try_from((msg_type, payload)) {
            Ok(message) => message,
            Err(ParserError::UnexpectedMessage(t)) => {
                return Some(Err(CodecError::UnsupportedMessageType {
                    id: None,
                    kind: format!("0x{:02x}", t),
                }))
            }
            Err(e) => return Some(Err(CodecError::malformed(id, e.to_string()))),
        };

        match message {
            AnyMessage::Common(CommonMessages::SetupConnection(m)) => Some(Ok(Inbound::Subscribe {
                id: None,
                user_agent: user_agent(&m),
            })),
            AnyMessage::Mining(Mining::OpenExtendedMiningChannel(m)) => {
                let id = Some(m.request_id as u64);
                Some(text(&m.user_identity, id).map(|username| Inbound::OpenChannel {
                    id,
                    username,
                    nominal_hashrate: m.nominal_hash_rate,
                }))
            }
            AnyMessage::Mining(Mining::SubmitSharesExtended(m)) => Some(Ok(Inbound::Submit {
                id: Some(m.sequence_number as u64),
                submission: Submission {
                    job_id: m.job_id as u64,
                    extranonce2: m.extranonce.to_vec(),
                    ntime: m.ntime,
                    nonce: m.nonce,
                    version: Some(RolledVersion::Full(m.version)),
                },
            })),
            AnyMessage::Mining(Mining::CloseChannel(_)) => Some(Ok(Inbound::Disconnect)),
            AnyMessage::JobDeclaration(JobDeclaration::AllocateMiningJobToken(m)) => {
                let id = Some(m.request_id as u64);
                Some(
                    text(&m.user_identifier, id).map(|user_identifier| Inbound::AllocateToken {
                        id,
                        user_identifier,
                    }),
                )
            }
            AnyMessage::JobDeclaration(JobDeclaration::DeclareMiningJob(m)) => self.declare(m),
            AnyMessage::JobDeclaration(JobDeclaration::ProvideMissingTransactionsSuccess(m)) => {
                Some(self.transactions(m))
            }
            _ => Some(Err(CodecError::UnsupportedMessageType {
                id: None,
                kind: message_type_to_name(msg_type).into(),
            })),
        }
    }

    fn declare(&mut self, m: DeclareMiningJob<'_>) -> Option<Decoded> {
        let id = Some(m.request_id as u64);
        let token = match <[u8; 8]>::try_from(m.mining_job_token.inner_as_ref()) {
            Ok(bytes) => u64::from_le_bytes(bytes),
            Err(_) => return Some(Err(CodecError::malformed(id, "token must be 8 bytes"))),
        };
        let mut request = match declared_template(m.excess_data.inner_as_ref()) {
            Ok(request) => request,
            Err(e) => return Some(Err(CodecError::malformed(id, format!("excess data: {}", e)))),
        };
        request.token = token;
        request.version = m.version;

        let tx_count = m.tx_ids_list.inner_as_ref().len();
        if tx_count == 0 {
            return Some(Ok(Inbound::CommitJob { id, request }));
        }
        let superseded = self.pending.replace(PendingDeclaration {
            request_id: m.request_id,
            request,
            tx_count,
        });
        superseded.map(|old| {
            debug!(request_id = old.request_id, "Declaration superseded before its transactions");
            Err(CodecError::malformed(
                Some(old.request_id as u64),
                "declaration superseded before its transactions",
            ))
        })
    }

    fn transactions(&mut self, m: ProvideMissingTransactionsSuccess<'_>) -> Decoded {
        let id = Some(m.request_id as u64);
        let mut pending = match self.pending.take() {
            Some(p) if p.request_id == m.request_id => p,
            other => {
                self.pending = other;
                return Err(CodecError::malformed(id, "no declaration awaiting transactions"));
            }
        };
        let transactions = m.transaction_list.to_vec();
        if transactions.len() != pending.tx_count {
            return Err(CodecError::malformed(id, "transaction count differs from declaration"));
        }
        pending.request.transactions = transactions;
        Ok(Inbound::CommitJob {
            id,
            request: pending.request,
        })
    }
}

fn outbound_err(what: &str, e: impl std::fmt::Debug) -> CodecError {
    CodecError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("cannot encode {}: {:?}", what, e),
    ))
}

fn str0255(s: &str) -> Result<Str0255<'static>, CodecError> {
    Str0255::try_from(s.to_string()).map_err(|e| outbound_err("string", e))
}

fn b064k(bytes: &[u8]) -> Result<B064K<'static>, CodecError> {
    B064K::try_from(bytes.to_vec()).map_err(|e| outbound_err("B064K", e))
}

fn request_id(id: RequestId) -> u32 {
    id.unwrap_or(0) as u32
}

/// Encode one message for the wire. Messages with no counterpart in this
/// protocol encode to nothing; a clean job encodes to two.
///
/// `channel_id` is the id of the session's open channel.
pub fn encode(msg: &Outbound, channel_id: u32) -> Result<Vec<Message>, CodecError> {
    let message: Message = match msg {
        Outbound::SubscribeResult { .. } => SetupConnectionSuccess {
            used_version: PROTOCOL_VERSION,
            flags: REQUIRES_EXTENDED_CHANNELS,
        }
        .into(),
        Outbound::AuthorizeResult { .. } | Outbound::ConfigureResult { .. } => return Ok(Vec::new()),
        Outbound::ChannelOpened {
            id,
            channel_id,
            extranonce1,
            extranonce2_size,
            difficulty,
            ..
        } => AnyMessage::Mining(Mining::OpenExtendedMiningChannelSuccess(
            OpenExtendedMiningChannelSuccess {
                request_id: request_id(*id),
                channel_id: *channel_id,
                target: U256::from(difficulty.to_target_le()),
                extranonce_size: *extranonce2_size as u16,
                extranonce_prefix: B032::try_from(extranonce1.to_bytes().to_vec())
                    .map_err(|e| outbound_err("extranonce prefix", e))?,
            },
        )),
        Outbound::ChannelRejected { id, code } => {
            AnyMessage::Mining(Mining::OpenMiningChannelError(OpenMiningChannelError {
                request_id: request_id(*id),
                error_code: str0255(code.as_str())?,
            }))
        }
        Outbound::NotifyJob(job) => {
            let job_id = job.job_id as u32;
            let path: Vec<U256<'static>> = job
                .merkle_branch
                .iter()
                .map(|node| U256::from(node.to_byte_array()))
                .collect();
            let new_job = AnyMessage::Mining(Mining::NewExtendedMiningJob(NewExtendedMiningJob {
                channel_id,
                job_id,
                // A clean job waits for its SetNewPrevHash.
                min_ntime: Sv2Option::new((!job.clean).then_some(job.time)),
                version: job.version,
                version_rolling_allowed: true,
                merkle_path: Seq0255::new(path).map_err(|e| outbound_err("merkle path", e))?,
                coinbase_tx_prefix: b064k(&job.coinbase1)?,
                coinbase_tx_suffix: b064k(&job.coinbase2)?,
            }));
            if !job.clean {
                return Ok(vec![new_job]);
            }
            let prev_hash = AnyMessage::Mining(Mining::SetNewPrevHash(SetNewPrevHash {
                channel_id,
                job_id,
                prev_hash: U256::from(job.prev_hash.to_byte_array()),
                min_ntime: job.time,
                nbits: job.bits,
            }));
            return Ok(vec![new_job, prev_hash]);
        }
        Outbound::SetDifficulty(difficulty) => AnyMessage::Mining(Mining::SetTarget(SetTarget {
            channel_id,
            maximum_target: U256::from(difficulty.to_target_le()),
        })),
        Outbound::SubmitResult { id, result } => match result {
            // Acknowledged one share at a time.
            Ok(()) => AnyMessage::Mining(Mining::SubmitSharesSuccess(SubmitSharesSuccess {
                channel_id,
                last_sequence_number: request_id(*id),
                new_submits_accepted_count: 1,
                new_shares_sum: 1,
            })),
            Err(code) => AnyMessage::Mining(Mining::SubmitSharesError(SubmitSharesError {
                channel_id,
                sequence_number: request_id(*id),
                error_code: str0255(code.as_str())?,
            })),
        },
        Outbound::TokenAllocated { id, token } => AnyMessage::JobDeclaration(
            JobDeclaration::AllocateMiningJobTokenSuccess(AllocateMiningJobTokenSuccess {
                request_id: request_id(*id),
                mining_job_token: B0255::try_from(token.to_le_bytes().to_vec())
                    .map_err(|e| outbound_err("token", e))?,
                coinbase_outputs: b064k(&[])?,
            }),
        ),
        Outbound::CommitJobResult { id, result } => match result {
            Ok(token) => AnyMessage::JobDeclaration(JobDeclaration::DeclareMiningJobSuccess(
                DeclareMiningJobSuccess {
                    request_id: request_id(*id),
                    new_mining_job_token: B0255::try_from(token.to_le_bytes().to_vec())
                        .map_err(|e| outbound_err("token", e))?,
                },
            )),
            Err(reason) => AnyMessage::JobDeclaration(JobDeclaration::DeclareMiningJobError(
                DeclareMiningJobError {
                    request_id: request_id(*id),
                    error_code: str0255(reason)?,
                    error_details: b064k(&[])?,
                },
            )),
        },
        Outbound::Error { code, .. } => SetupConnectionError {
            flags: 0,
            error_code: str0255(code.as_str())?,
        }
        .into(),
    };
    Ok(vec![message])
}
