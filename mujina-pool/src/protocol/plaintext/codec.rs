//! Line framing for Stratum v1.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::messages::{self, JsonRpcMessage};
use crate::protocol::{CodecError, Decoded, Outbound};
use crate::tracing::prelude::*;

/// Longest line accepted from a miner. Real requests are a few hundred bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024;

/// `LinesCodec` plus the JSON-RPC mapping.
///
/// Over-long lines, invalid UTF-8, and unparsable JSON come out as
/// `Some(Err(MalformedMessage))` items; the stream keeps going. Blank lines
/// are skipped.
#[derive(Debug, Clone)]
pub struct PlaintextCodec {
    lines: LinesCodec,
}

impl PlaintextCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    fn lift(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Decoded>, CodecError> {
        match result {
            Ok(Some(line)) => Ok(Some(parse_line(line.trim()))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Ok(Some(Err(CodecError::malformed(None, "line too long"))))
            }
            // LinesCodec reports invalid UTF-8 as InvalidData after it has
            // consumed the line.
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Err(CodecError::malformed(None, "invalid UTF-8"))))
            }
            Err(LinesCodecError::Io(e)) => Err(CodecError::Io(e)),
        }
    }
}

fn parse_line(line: &str) -> Decoded {
    trace!(rx = %line, "Received line");
    match serde_json::from_str::<JsonRpcMessage>(line) {
        Ok(msg) => messages::decode(msg),
        Err(e) => Err(CodecError::malformed(None, format!("invalid JSON: {}", e))),
    }
}

fn is_blank(result: &Result<Option<String>, LinesCodecError>) -> bool {
    matches!(result, Ok(Some(line)) if line.trim().is_empty())
}

impl Default for PlaintextCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for PlaintextCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let next = self.lines.decode(src);
            if !is_blank(&next) {
                return Self::lift(next);
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let next = self.lines.decode_eof(src);
            if !is_blank(&next) {
                return Self::lift(next);
            }
        }
    }
}

impl Encoder<Outbound> for PlaintextCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let msg = messages::encode(&item);
        let json = serde_json::to_string(&msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        trace!(tx = %json, "Sending line");
        self.lines.encode(json, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => CodecError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "outbound line too long",
            )),
        })
    }
}
