pub mod codec;
pub mod envelope;
pub mod message;

use std::fmt;

use codec::{CodecError, WireCodec};
use envelope::{Envelope, EnvelopeError};

/// Anything structurally wrong with an inbound frame. Never a handler concern.
#[derive(Debug)]
pub enum ProtocolError {
    Codec(CodecError),
    Envelope(EnvelopeError),
    Body(message::MessageError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "frame codec error: {source}"),
            Self::Envelope(source) => write!(f, "envelope error: {source}"),
            Self::Body(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn decode_envelope(codec: &WireCodec, frame: &[u8]) -> Result<Envelope, ProtocolError> {
    let raw = codec.decode_frame(frame).map_err(ProtocolError::Codec)?;
    Envelope::from_raw(&raw).map_err(ProtocolError::Envelope)
}

pub fn encode_envelope(codec: &WireCodec, envelope: Envelope) -> Result<Vec<u8>, CodecError> {
    codec.encode_frame(&envelope.into_raw())
}
