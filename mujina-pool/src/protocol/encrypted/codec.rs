//! Noise transport frames as a tokio-util codec.

use bytes::BytesMut;
use codec_sv2::{NoiseEncoder, StandardNoiseDecoder, StandardSv2Frame, State};
use tokio_util::codec::{Decoder, Encoder};

use super::messages::{self, InboundDecoder, Message};
use crate::protocol::{CodecError, Decoded, Outbound};
use crate::tracing::prelude::*;

/// Largest payload a u24 frame length can describe.
pub const MAX_FRAME_LEN: usize = 0x00ff_ffff;

/// Encrypted Stratum v2 frames of `(msg_type, payload)` over a transport
/// state from the handshake.
///
/// Any authentication failure or oversize frame is fatal.
pub struct FrameCodec {
    state: State,
    decoder: StandardNoiseDecoder<Message>,
    encoder: NoiseEncoder<Message>,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(state: State, max_frame_len: usize) -> Self {
        Self {
            state,
            decoder: StandardNoiseDecoder::new(),
            encoder: NoiseEncoder::new(),
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = (u8, Vec<u8>);
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // The decoder asks for exactly the bytes that complete its next
            // step: the encrypted header, then the encrypted payload.
            let need = self.decoder.writable_len();
            if src.len() < need {
                src.reserve(need - src.len());
                return Ok(None);
            }
            let chunk = src.split_to(need);
            self.decoder.writable().copy_from_slice(&chunk);

            match self.decoder.next_frame(&mut self.state) {
                Ok(frame) => {
                    let mut frame: StandardSv2Frame<Message> = frame
                        .try_into()
                        .map_err(|_| CodecError::HandshakeFailed("handshake frame in transport".into()))?;
                    let header = frame
                        .get_header()
                        .ok_or_else(|| CodecError::HandshakeFailed("frame without header".into()))?;
                    return Ok(Some((header.msg_type(), frame.payload().to_vec())));
                }
                Err(codec_sv2::Error::MissingBytes(_)) => {
                    let len = self.decoder.writable_len();
                    if len > self.max_frame_len {
                        return Err(CodecError::HandshakeFailed(format!(
                            "frame of {} bytes exceeds limit",
                            len
                        )));
                    }
                }
                Err(e) => return Err(CodecError::HandshakeFailed(e.to_string())),
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame: StandardSv2Frame<Message> = item.try_into().map_err(|e| {
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("outbound frame: {}", e),
            ))
        })?;
        let bytes = self
            .encoder
            .encode(frame.into(), &mut self.state)
            .map_err(|e| CodecError::HandshakeFailed(e.to_string()))?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

/// [`FrameCodec`] plus the message mapping.
pub struct EncryptedCodec {
    frames: FrameCodec,
    inbound: InboundDecoder,
    channel_id: u32,
}

impl EncryptedCodec {
    pub fn new(state: State, max_frame_len: usize) -> Self {
        Self {
            frames: FrameCodec::new(state, max_frame_len),
            inbound: InboundDecoder::new(),
            channel_id: 0,
        }
    }
}

impl Decoder for EncryptedCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some((msg_type, mut payload)) = self.frames.decode(src)? {
            trace!(msg_type, len = payload.len(), "Received frame");
            if let Some(item) = self.inbound.decode(msg_type, &mut payload) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

impl Encoder<Outbound> for EncryptedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if let Outbound::ChannelOpened { channel_id, .. } = &item {
            self.channel_id = *channel_id;
        }
        for message in messages::encode(&item, self.channel_id)? {
            trace!(%message, "Sending frame");
            self.frames.encode(message, dst)?;
        }
        Ok(())
    }
}
