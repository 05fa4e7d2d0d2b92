//! Encrypted binary protocol: Stratum v2 over a Noise NX channel.
//!
//! A connection on the encrypted port must complete the [`handshake`]
//! before any application frame is read; a failed handshake closes the
//! connection with no plaintext fallback. After that, [`EncryptedCodec`]
//! carries the Stratum v2 messages of [`messages`] in `codec_sv2` frames.

mod codec;
pub mod handshake;
pub mod messages;

pub use codec::{EncryptedCodec, FrameCodec, MAX_FRAME_LEN};
pub use handshake::{authority_public_key, HandshakeError, Responder};

use crate::protocol::CodecError;

impl From<HandshakeError> for CodecError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Io(e) => CodecError::Io(e),
            other => CodecError::HandshakeFailed(other.to_string()),
        }
    }
}
