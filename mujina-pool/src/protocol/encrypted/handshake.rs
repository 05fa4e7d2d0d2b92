//! Noise NX key exchange, responder side.
//!
//! The pool answers the miner's 64-byte ElligatorSwift ephemeral key with
//! its own ephemeral, a fresh static key and a certificate over that key
//! signed by the authority key miners are configured with. The exchange
//! itself is `noise_sv2`; this module owns the key material and the byte
//! plumbing around it.

use std::time::Duration;

use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use codec_sv2::noise_sv2::{self, ELLSWIFT_ENCODING_SIZE};
use codec_sv2::{HandshakeRole, State};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tracing::prelude::*;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid authority key: {0}")]
    Keys(String),

    #[error("key exchange failed: {0}")]
    Exchange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<codec_sv2::Error> for HandshakeError {
    fn from(err: codec_sv2::Error) -> Self {
        HandshakeError::Exchange(err.to_string())
    }
}

/// Authority credentials for the encrypted listener.
///
/// Every accepted connection gets its own `noise_sv2` responder, and with
/// it a new static key and certificate.
#[derive(Clone)]
pub struct Responder {
    authority_public: XOnlyPublicKey,
    authority_secret: [u8; 32],
    cert_validity: Duration,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("authority_public", &self.authority_public)
            .field("cert_validity", &self.cert_validity)
            .finish_non_exhaustive()
    }
}

impl Responder {
    pub fn new(authority: &SecretKey, cert_validity: Duration) -> Result<Self, HandshakeError> {
        let responder = Self {
            authority_public: authority_public_key(authority),
            authority_secret: authority.secret_bytes(),
            cert_validity,
        };
        responder.role()?;
        Ok(responder)
    }

    /// Public key miners pin to authenticate this pool.
    pub fn authority_public(&self) -> XOnlyPublicKey {
        self.authority_public
    }

    fn role(&self) -> Result<HandshakeRole, HandshakeError> {
        noise_sv2::Responder::from_authority_kp(
            &self.authority_public.serialize(),
            &self.authority_secret,
            self.cert_validity,
        )
        .map(HandshakeRole::Responder)
        .map_err(|e| HandshakeError::Keys(format!("{:?}", e)))
    }

    /// Run the exchange on a freshly accepted stream.
    ///
    /// Returns the codec state in transport mode, ready for
    /// [`EncryptedCodec`](super::EncryptedCodec).
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<State, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ephemeral = [0u8; ELLSWIFT_ENCODING_SIZE];
        stream.read_exact(&mut ephemeral).await?;

        let (reply, transport) = State::initialized(self.role()?).step_1(ephemeral)?;
        stream.write_all(&reply.get_payload_when_handshaking()).await?;
        stream.flush().await?;
        trace!("Handshake reply sent");
        Ok(transport)
    }
}

pub fn authority_public_key(authority: &SecretKey) -> XOnlyPublicKey {
    let secp = Secp256k1::signing_only();
    Keypair::from_secret_key(&secp, authority).x_only_public_key().0
}

/// Miner side of the exchange, used by tests driving the listener.
#[cfg(test)]
pub(crate) async fn initiate<S>(
    stream: &mut S,
    authority: XOnlyPublicKey,
) -> Result<State, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use codec_sv2::noise_sv2::INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE;

    let initiator = noise_sv2::Initiator::from_raw_k(authority.serialize())
        .map_err(|e| HandshakeError::Keys(format!("{:?}", e)))?;
    let mut state = State::initialized(HandshakeRole::Initiator(initiator));
    let first = state.step_0()?;
    stream.write_all(&first.get_payload_when_handshaking()).await?;
    stream.flush().await?;

    let mut reply = [0u8; INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
    stream.read_exact(&mut reply).await?;
    Ok(state.step_2(reply)?)
}
