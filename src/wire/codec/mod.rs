use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use rmpv::{Integer, Value};

use crate::config::AppConfig;

pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

/// A decoded MessagePack map with string keys, the unit carried by one frame.
pub type RawMessage = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ZeroLength,
    LengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingData,
    MustBeMap,
    MapKeyMustBeUtf8String,
    FloatNotAllowed,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than the 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ZeroLength => write!(f, "frame length cannot be zero"),
            Self::LengthTooLarge { length, limit } => {
                write!(f, "frame length {length} exceeds max {limit}")
            }
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingData => write!(f, "payload contains trailing MessagePack data"),
            Self::MustBeMap => write!(f, "message must be a MessagePack map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::FloatNotAllowed => write!(f, "floats are not allowed on the wire"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: DEFAULT_MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

/// Length-prefixed MessagePack codec. Each frame is a 4-byte big-endian
/// length followed by exactly one MessagePack map.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    config: CodecConfig,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self::new(CodecConfig {
            max_envelope_size_bytes: app_config.wire.max_envelope_size_bytes,
        })
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.config.max_envelope_size_bytes
    }

    pub fn encode_frame(&self, message: &RawMessage) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(message)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<RawMessage, CodecError> {
        let declared_len = self.declared_length(frame)?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    pub fn encode_payload(&self, message: &RawMessage) -> Result<Vec<u8>, CodecError> {
        let value = raw_message_to_value(message)?;
        let encoded = encode_value(&value)?;

        if encoded.len() > self.config.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.config.max_envelope_size_bytes,
            });
        }

        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<RawMessage, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ZeroLength);
        }
        if payload.len() > self.config.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_envelope_size_bytes,
            });
        }

        decode_map(payload)
    }

    fn declared_length(&self, frame: &[u8]) -> Result<usize, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared_len == 0 {
            return Err(CodecError::ZeroLength);
        }
        if declared_len > self.config.max_envelope_size_bytes {
            return Err(CodecError::LengthTooLarge {
                length: declared_len,
                limit: self.config.max_envelope_size_bytes,
            });
        }

        Ok(declared_len)
    }
}

/// Reassembles complete frames out of an arbitrarily chunked byte stream.
#[derive(Debug)]
pub struct FrameReader {
    codec: WireCodec,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new(codec: WireCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame (header included), `Ok(None)` when more
    /// bytes are needed. A header error poisons the stream: the caller is
    /// expected to drop the connection since frame boundaries are lost.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared_len = self.codec.declared_length(&self.buffer)?;
        let total = FRAME_HEADER_SIZE_BYTES + declared_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let rest = self.buffer.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buffer, rest)))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Encodes a nested message body (no length prefix) as carried inside an envelope.
pub fn encode_body(message: &RawMessage) -> Result<Vec<u8>, CodecError> {
    encode_value(&raw_message_to_value(message)?)
}

/// Decodes a nested message body produced by [`encode_body`].
pub fn decode_body(body: &[u8]) -> Result<RawMessage, CodecError> {
    if body.is_empty() {
        return Err(CodecError::ZeroLength);
    }
    decode_map(body)
}

fn raw_message_to_value(message: &RawMessage) -> Result<Value, CodecError> {
    let mut map_pairs = Vec::with_capacity(message.len());
    for (key, value) in message {
        validate_value(value)?;
        map_pairs.push((Value::String(key.as_str().into()), value.clone()));
    }
    Ok(Value::Map(map_pairs))
}

fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, value).map_err(CodecError::MessagePackEncode)?;
    Ok(encoded)
}

fn decode_map(payload: &[u8]) -> Result<RawMessage, CodecError> {
    let mut cursor = Cursor::new(payload);
    let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
    if cursor.position() as usize != payload.len() {
        return Err(CodecError::TrailingData);
    }

    let Value::Map(entries) = value else {
        return Err(CodecError::MustBeMap);
    };

    let mut message = RawMessage::new();
    for (key, value) in entries {
        let key = parse_key(&key)?;
        validate_value(&value)?;
        message.insert(key, value);
    }

    Ok(message)
}

fn parse_key(key: &Value) -> Result<String, CodecError> {
    key.as_str()
        .map(str::to_owned)
        .ok_or(CodecError::MapKeyMustBeUtf8String)
}

fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil | Value::Boolean(_) | Value::String(_) | Value::Binary(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            parse_key(key)?;
            validate_value(value)
        }),
        Value::F32(_) | Value::F64(_) => Err(CodecError::FloatNotAllowed),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }

    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use super::{
        decode_body, encode_body, CodecConfig, CodecError, FrameReader, RawMessage, WireCodec,
    };

    fn sample_message() -> RawMessage {
        let mut message = RawMessage::new();
        message.insert("op".to_owned(), Value::Integer(11.into()));
        message.insert("rid".to_owned(), Value::String("web-42".into()));
        message.insert("b".to_owned(), Value::Binary(vec![0xde, 0xad]));
        message
    }

    fn small_codec(limit: usize) -> WireCodec {
        WireCodec::new(CodecConfig {
            max_envelope_size_bytes: limit,
        })
    }

    #[test]
    fn frame_carries_big_endian_length_prefix() {
        let codec = WireCodec::default();
        let frame = codec.encode_frame(&sample_message()).expect("frame should encode");

        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);

        let decoded = codec.decode_frame(&frame).expect("frame should decode");
        assert_eq!(decoded.get("rid"), Some(&Value::String("web-42".into())));
    }

    #[test]
    fn rejects_floats_and_extensions() {
        let mut message = RawMessage::new();
        message.insert("ratio".to_owned(), Value::F64(0.5));
        assert!(matches!(
            encode_body(&message),
            Err(CodecError::FloatNotAllowed)
        ));

        let mut message = RawMessage::new();
        message.insert("ext".to_owned(), Value::Ext(3, vec![1]));
        assert!(matches!(
            encode_body(&message),
            Err(CodecError::ExtensionTypeNotAllowed)
        ));
    }

    #[test]
    fn rejects_zero_and_oversized_declared_lengths() {
        let codec = small_codec(16);
        assert!(matches!(
            codec.decode_frame(&[0, 0, 0, 0]),
            Err(CodecError::ZeroLength)
        ));
        assert!(matches!(
            codec.decode_frame(&[0, 0, 0, 17]),
            Err(CodecError::LengthTooLarge { length: 17, limit: 16 })
        ));
    }

    #[test]
    fn rejects_non_map_and_trailing_payloads() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Array(vec![])).expect("array should encode");
        assert!(matches!(decode_body(&payload), Err(CodecError::MustBeMap)));

        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Map(vec![])).expect("map should encode");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("nil should encode");
        assert!(matches!(decode_body(&payload), Err(CodecError::TrailingData)));
    }

    #[test]
    fn garbage_bytes_yield_typed_errors() {
        let codec = WireCodec::default();
        for garbage in [&[0xc1_u8][..], &[0x81, 0x01], &[0xff, 0x00, 0x13], &[0x92]] {
            let mut frame = (garbage.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(garbage);
            assert!(codec.decode_frame(&frame).is_err());
        }
    }

    #[test]
    fn frame_reader_reassembles_split_and_coalesced_frames() {
        let codec = WireCodec::default();
        let first = codec.encode_frame(&sample_message()).expect("frame should encode");
        let mut second_message = sample_message();
        second_message.insert("rid".to_owned(), Value::String("web-43".into()));
        let second = codec.encode_frame(&second_message).expect("frame should encode");

        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut reader = FrameReader::new(codec);
        reader.push(&stream[..3]);
        assert!(reader.next_frame().expect("partial header is fine").is_none());

        reader.push(&stream[3..first.len() + 2]);
        let frame = reader
            .next_frame()
            .expect("first frame should parse")
            .expect("first frame should be complete");
        assert_eq!(frame, first);
        assert!(reader.next_frame().expect("partial body is fine").is_none());

        reader.push(&stream[first.len() + 2..]);
        let frame = reader
            .next_frame()
            .expect("second frame should parse")
            .expect("second frame should be complete");
        assert_eq!(frame, second);
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn frame_reader_surfaces_oversized_header() {
        let mut reader = FrameReader::new(small_codec(8));
        reader.push(&[0, 0, 1, 0, 0xaa]);
        assert!(matches!(
            reader.next_frame(),
            Err(CodecError::LengthTooLarge { .. })
        ));
    }
}
