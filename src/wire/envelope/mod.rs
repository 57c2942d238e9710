use std::fmt;

use rmpv::Value;

use crate::wire::codec::RawMessage;

pub const PROTOCOL_VERSION: i64 = 1;

/// Outer framing discriminator: worker control traffic versus operator commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Control,
    Command,
}

impl EnvelopeKind {
    pub fn code(self) -> i64 {
        match self {
            Self::Control => 0,
            Self::Command => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Control),
            1 => Some(Self::Command),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "CONTROL",
            Self::Command => "COMMAND",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    UnknownKind { code: i64 },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::UnknownKind { code } => write!(f, "unknown envelope kind {code}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl Envelope {
    pub fn new(kind: EnvelopeKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    pub fn control(body: Vec<u8>) -> Self {
        Self::new(EnvelopeKind::Control, body)
    }

    pub fn command(body: Vec<u8>) -> Self {
        Self::new(EnvelopeKind::Command, body)
    }

    pub fn from_raw(raw: &RawMessage) -> Result<Self, EnvelopeError> {
        let version = required_i64(raw, "v")?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::InvalidProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let code = required_i64(raw, "k")?;
        let kind = EnvelopeKind::from_code(code).ok_or(EnvelopeError::UnknownKind { code })?;

        let body = match raw.get("b") {
            None => return Err(EnvelopeError::MissingField { field: "b" }),
            Some(Value::Binary(bytes)) => bytes.clone(),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: "b",
                    expected: "binary",
                })
            }
        };

        Ok(Self { kind, body })
    }

    pub fn into_raw(self) -> RawMessage {
        let mut raw = RawMessage::new();
        raw.insert("v".to_owned(), Value::Integer(PROTOCOL_VERSION.into()));
        raw.insert("k".to_owned(), Value::Integer(self.kind.code().into()));
        raw.insert("b".to_owned(), Value::Binary(self.body));
        raw
    }
}

pub(crate) fn required_i64(raw: &RawMessage, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = raw.get(field).ok_or(EnvelopeError::MissingField { field })?;
    value.as_i64().ok_or(EnvelopeError::InvalidFieldType {
        field,
        expected: "int64",
    })
}
