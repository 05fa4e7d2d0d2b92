//! Wire protocols spoken to miners.
//!
//! Two codecs translate their wire formats into one closed internal
//! representation, [`Inbound`] and [`Outbound`]. The session layer only ever
//! sees these types; which codec is in use is fixed at accept time by the
//! listening port ([`Protocol`]).
//!
//! - [`plaintext`]: Stratum v1, newline-delimited JSON-RPC.
//! - [`encrypted`]: Stratum v2 over a Noise handshake (`codec_sv2`).
//!
//! Codecs do no business logic. Per-message decode failures
//! ([`CodecError::MalformedMessage`], [`CodecError::UnsupportedMessageType`])
//! are yielded as stream items so the session can answer them and carry on;
//! only fatal errors end the stream.

pub mod encrypted;
pub mod plaintext;

use std::fmt;

use async_trait::async_trait;
use bitcoin::{BlockHash, TxMerkleNode};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::types::{Difficulty, Extranonce1};

/// Wire protocol of a session, chosen by listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Plaintext,
    Encrypted,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Plaintext => write!(f, "plaintext"),
            Protocol::Encrypted => write!(f, "encrypted"),
        }
    }
}

/// Request correlation id. Plaintext JSON-RPC ids may be null; encrypted
/// request ids are always present.
pub type RequestId = Option<u64>;

/// Version bits supplied with a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RolledVersion {
    /// Only the rolled bits (Stratum v1 BIP310 `version_bits`); combined
    /// with the job version under the negotiated mask.
    Bits(u32),
    /// The complete header version.
    Full(u32),
}

/// The fields a miner supplies for one share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Submission {
    /// Job generation the share claims to be for.
    pub job_id: u64,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub version: Option<RolledVersion>,
}

/// BIP310 `version-rolling` request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRollingRequest {
    pub mask: u32,
    pub min_bit_count: u32,
}

/// Miner-declared template for job negotiation.
///
/// Transactions and outputs are carried as raw consensus bytes; the job
/// manager decides whether they parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitJobRequest {
    pub token: u64,
    pub version: u32,
    pub prev_hash: BlockHash,
    pub bits: u32,
    pub time: u32,
    pub coinbase_value: u64,
    pub fee_total: u64,
    pub coinbase_outputs: Vec<Vec<u8>>,
    pub transactions: Vec<Vec<u8>>,
}

/// Everything a miner can send, independent of wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Subscribe {
        id: RequestId,
        user_agent: Option<String>,
    },
    Authorize {
        id: RequestId,
        username: String,
        password: Option<String>,
    },
    Configure {
        id: RequestId,
        version_rolling: Option<VersionRollingRequest>,
    },
    /// Encrypted protocol: subscribe and authorize in one message.
    OpenChannel {
        id: RequestId,
        username: String,
        nominal_hashrate: f32,
    },
    Submit {
        id: RequestId,
        submission: Submission,
    },
    SuggestDifficulty {
        id: RequestId,
        difficulty: f64,
    },
    AllocateToken {
        id: RequestId,
        user_identifier: String,
    },
    CommitJob {
        id: RequestId,
        request: CommitJobRequest,
    },
    Disconnect,
}

impl Inbound {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Subscribe { .. } => "subscribe",
            Inbound::Authorize { .. } => "authorize",
            Inbound::Configure { .. } => "configure",
            Inbound::OpenChannel { .. } => "open_channel",
            Inbound::Submit { .. } => "submit",
            Inbound::SuggestDifficulty { .. } => "suggest_difficulty",
            Inbound::AllocateToken { .. } => "allocate_token",
            Inbound::CommitJob { .. } => "commit_job",
            Inbound::Disconnect => "disconnect",
        }
    }
}

/// Work notification for one job, with coinbase parts already specialized
/// for the receiving session's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotify {
    pub job_id: u64,
    pub prev_hash: BlockHash,
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branch: Vec<TxMerkleNode>,
    pub version: u32,
    pub bits: u32,
    pub time: u32,
    pub clean: bool,
}

/// Fixed, detail-free error codes sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    Other,
    JobNotFound,
    Duplicate,
    LowDifficulty,
    Unauthorized,
    NotSubscribed,
    InvalidVersion,
    Malformed,
    TimeOutOfRange,
    Unsupported,
    InvalidToken,
    TooManyTokens,
}

impl ErrorCode {
    /// Stratum v1 numeric error code.
    pub fn stratum_code(self) -> i64 {
        match self {
            ErrorCode::JobNotFound => 21,
            ErrorCode::Duplicate => 22,
            ErrorCode::LowDifficulty => 23,
            ErrorCode::Unauthorized => 24,
            ErrorCode::NotSubscribed => 25,
            _ => 20,
        }
    }

    /// Stratum v1 human-readable message.
    pub fn stratum_message(self) -> &'static str {
        match self {
            ErrorCode::Other => "Other/Unknown",
            ErrorCode::JobNotFound => "Job not found",
            ErrorCode::Duplicate => "Duplicate share",
            ErrorCode::LowDifficulty => "Low difficulty share",
            ErrorCode::Unauthorized => "Unauthorized worker",
            ErrorCode::NotSubscribed => "Not subscribed",
            ErrorCode::InvalidVersion => "Invalid version bits",
            ErrorCode::Malformed => "Malformed request",
            ErrorCode::TimeOutOfRange => "ntime out of range",
            ErrorCode::Unsupported => "Unsupported method",
            ErrorCode::InvalidToken => "Invalid token",
            ErrorCode::TooManyTokens => "Too many outstanding tokens",
        }
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Everything the pool can send, independent of wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    SubscribeResult {
        id: RequestId,
        subscription_id: String,
        extranonce1: Extranonce1,
        extranonce2_size: usize,
    },
    AuthorizeResult {
        id: RequestId,
        authorized: bool,
    },
    ConfigureResult {
        id: RequestId,
        /// Granted mask, or `None` if version rolling was not granted.
        version_rolling_mask: Option<u32>,
    },
    ChannelOpened {
        id: RequestId,
        channel_id: u32,
        extranonce1: Extranonce1,
        extranonce2_size: usize,
        difficulty: Difficulty,
        version_rolling_mask: u32,
    },
    ChannelRejected {
        id: RequestId,
        code: ErrorCode,
    },
    NotifyJob(JobNotify),
    SetDifficulty(Difficulty),
    SubmitResult {
        id: RequestId,
        result: Result<(), ErrorCode>,
    },
    TokenAllocated {
        id: RequestId,
        token: u64,
    },
    CommitJobResult {
        id: RequestId,
        result: Result<u64, &'static str>,
    },
    Error {
        id: RequestId,
        code: ErrorCode,
    },
}

/// Errors from decoding or transporting protocol messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Message could not be parsed; the session continues.
    #[error("malformed message: {reason}")]
    MalformedMessage { id: RequestId, reason: String },

    /// Key exchange or frame authentication failed; the connection ends.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Well-formed but unknown message; the session continues.
    #[error("unsupported message type: {kind}")]
    UnsupportedMessageType { id: RequestId, kind: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub fn malformed(id: RequestId, reason: impl Into<String>) -> Self {
        CodecError::MalformedMessage {
            id,
            reason: reason.into(),
        }
    }

    /// Whether this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::HandshakeFailed(_) | CodecError::Io(_))
    }
}

/// One decoded item: a message, or a non-fatal per-message error.
pub type Decoded = Result<Inbound, CodecError>;

/// Message-level I/O for a session.
///
/// Production sessions run over [`FramedTransport`]; tests can substitute a
/// channel-backed mock.
#[async_trait]
pub trait Transport: Send {
    /// Read the next item.
    ///
    /// Returns `None` on clean close. `Some(Err(e))` with `e.is_fatal()`
    /// means the connection is unusable.
    async fn read_message(&mut self) -> Option<Decoded>;

    async fn write_message(&mut self, msg: Outbound) -> Result<(), CodecError>;
}

/// A byte stream wrapped in one of the protocol codecs.
pub struct FramedTransport<S, C> {
    inner: Framed<S, C>,
}

impl<S, C> FramedTransport<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, codec: C) -> Self {
        Self {
            inner: Framed::new(stream, codec),
        }
    }
}

#[async_trait]
impl<S, C> Transport for FramedTransport<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Decoder<Item = Decoded, Error = CodecError> + Encoder<Outbound, Error = CodecError> + Send,
{
    async fn read_message(&mut self) -> Option<Decoded> {
        match self.inner.next().await? {
            Ok(item) => Some(item),
            Err(fatal) => Some(Err(fatal)),
        }
    }

    async fn write_message(&mut self, msg: Outbound) -> Result<(), CodecError> {
        self.inner.send(msg).await
    }
}

/// Channel-backed transport for deterministic session tests.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<Decoded>,
    tx: tokio::sync::mpsc::UnboundedSender<Outbound>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Decoded>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
}

#[cfg(test)]
impl MockTransport {
    pub fn pair() -> (Self, MockTransportHandle) {
        let (session_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, session_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            MockTransport {
                rx: session_rx,
                tx: session_tx,
            },
            MockTransportHandle {
                tx: handle_tx,
                rx: handle_rx,
            },
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> Option<Decoded> {
        self.rx.recv().await
    }

    async fn write_message(&mut self, msg: Outbound) -> Result<(), CodecError> {
        self.tx.send(msg).map_err(|_| {
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock transport dropped",
            ))
        })
    }
}

#[cfg(test)]
impl MockTransportHandle {
    pub fn send(&self, msg: Inbound) {
        self.tx.send(Ok(msg)).expect("transport dropped");
    }

    pub fn send_error(&self, err: CodecError) {
        self.tx.send(Err(err)).expect("transport dropped");
    }

    pub async fn recv(&mut self) -> Outbound {
        self.rx.recv().await.expect("transport dropped")
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_stratum() {
        assert_eq!(ErrorCode::JobNotFound.stratum_code(), 21);
        assert_eq!(ErrorCode::Duplicate.stratum_code(), 22);
        assert_eq!(ErrorCode::LowDifficulty.stratum_code(), 23);
        assert_eq!(ErrorCode::Unauthorized.stratum_code(), 24);
        assert_eq!(ErrorCode::NotSubscribed.stratum_code(), 25);
        assert_eq!(ErrorCode::InvalidVersion.stratum_code(), 20);
    }

    #[test]
    fn test_error_code_strings_are_kebab_case() {
        assert_eq!(ErrorCode::LowDifficulty.as_str(), "low-difficulty");
        assert_eq!(ErrorCode::TimeOutOfRange.as_str(), "time-out-of-range");
    }

    #[test]
    fn test_fatality() {
        assert!(!CodecError::malformed(None, "x").is_fatal());
        assert!(CodecError::HandshakeFailed("x".into()).is_fatal());
        assert!(!CodecError::UnsupportedMessageType {
            id: Some(1),
            kind: "mining.foo".into()
        }
        .is_fatal());
    }
}
