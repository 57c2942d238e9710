use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::{decode_body, encode_body, CodecError, RawMessage, WireCodec};
use crate::wire::envelope::{required_i64, Envelope, EnvelopeError};

pub type PayloadMap = BTreeMap<String, Value>;

/// Request id used for frames the master pushes without a preceding request.
pub const SERVER_PUSH_REQUEST_ID: &str = "0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlOperate {
    HeartBeat,
}

impl ControlOperate {
    pub fn code(self) -> i64 {
        match self {
            Self::HeartBeat => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::HeartBeat),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandOperate {
    ExecuteDebug,
    CancelJob,
    UpdateJob,
    ExecuteJob,
}

impl CommandOperate {
    pub const ALL: [Self; 4] = [
        Self::ExecuteDebug,
        Self::CancelJob,
        Self::UpdateJob,
        Self::ExecuteJob,
    ];

    pub fn code(self) -> i64 {
        match self {
            Self::ExecuteDebug => 10,
            Self::CancelJob => 11,
            Self::UpdateJob => 12,
            Self::ExecuteJob => 13,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|operate| operate.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecuteDebug => "ExecuteDebug",
            Self::CancelJob => "CancelJob",
            Self::UpdateJob => "UpdateJob",
            Self::ExecuteJob => "ExecuteJob",
        }
    }
}

impl fmt::Display for CommandOperate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes a command result can carry back to the requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCode {
    NotFound,
    InvalidPayload,
    JobNotRunning,
    JobDisabled,
    NoWorkerAvailable,
    StoreError,
    Busy,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::JobNotRunning => "JOB_NOT_RUNNING",
            Self::JobDisabled => "JOB_DISABLED",
            Self::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
            Self::StoreError => "STORE_ERROR",
            Self::Busy => "BUSY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::NotFound,
            Self::InvalidPayload,
            Self::JobNotRunning,
            Self::JobDisabled,
            Self::NoWorkerAvailable,
            Self::StoreError,
            Self::Busy,
        ]
        .into_iter()
        .find(|code| code.as_str() == raw)
    }
}

#[derive(Debug)]
pub enum MessageError {
    Codec(CodecError),
    Envelope(EnvelopeError),
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "message body codec error: {source}"),
            Self::Envelope(source) => write!(f, "message body error: {source}"),
            Self::MissingField { field } => write!(f, "missing message field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid message field '{field}', expected {expected}")
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// Keep-alive and other worker control traffic, carried in `CONTROL` envelopes.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlMessage {
    pub operate: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

impl ControlMessage {
    pub fn new(operate: ControlOperate, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            operate: operate.code(),
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn known_operate(&self) -> Option<ControlOperate> {
        ControlOperate::from_code(self.operate)
    }

    pub fn decode(body: &[u8]) -> Result<Self, MessageError> {
        let raw = decode_body(body).map_err(MessageError::Codec)?;
        let (operate, request_id, payload) = parse_common(&raw)?;
        Ok(Self {
            operate,
            request_id,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_body(&common_raw(self.operate, &self.request_id, &self.payload))
    }

    pub fn to_frame(&self, codec: &WireCodec) -> Result<Vec<u8>, CodecError> {
        codec.encode_frame(&Envelope::control(self.encode()?).into_raw())
    }
}

/// Operator command carried in `COMMAND` envelopes. The payload is owned by
/// whichever handler the operate selects.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandMessage {
    pub operate: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

impl CommandMessage {
    pub fn new(operate: CommandOperate, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            operate: operate.code(),
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn known_operate(&self) -> Option<CommandOperate> {
        CommandOperate::from_code(self.operate)
    }

    pub fn decode(body: &[u8]) -> Result<Self, MessageError> {
        let raw = decode_body(body).map_err(MessageError::Codec)?;
        let (operate, request_id, payload) = parse_common(&raw)?;
        Ok(Self {
            operate,
            request_id,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_body(&common_raw(self.operate, &self.request_id, &self.payload))
    }

    pub fn to_frame(&self, codec: &WireCodec) -> Result<Vec<u8>, CodecError> {
        codec.encode_frame(&Envelope::command(self.encode()?).into_raw())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    Ok,
    Error { code: FailureCode, message: String },
}

/// Outcome of one command, echoed back with the command's operate and rid.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub operate: i64,
    pub request_id: String,
    pub status: ResultStatus,
    pub payload: PayloadMap,
}

impl CommandResult {
    pub fn ok(command: &CommandMessage, payload: PayloadMap) -> Self {
        Self {
            operate: command.operate,
            request_id: command.request_id.clone(),
            status: ResultStatus::Ok,
            payload,
        }
    }

    pub fn failure(command: &CommandMessage, code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            operate: command.operate,
            request_id: command.request_id.clone(),
            status: ResultStatus::Error {
                code,
                message: message.into(),
            },
            payload: PayloadMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    pub fn failure_code(&self) -> Option<FailureCode> {
        match &self.status {
            ResultStatus::Ok => None,
            ResultStatus::Error { code, .. } => Some(*code),
        }
    }

    pub fn to_raw(&self) -> RawMessage {
        let mut raw = common_raw(self.operate, &self.request_id, &self.payload);
        match &self.status {
            ResultStatus::Ok => {
                raw.insert("status".to_owned(), Value::String("ok".into()));
            }
            ResultStatus::Error { code, message } => {
                raw.insert("status".to_owned(), Value::String("error".into()));
                raw.insert("code".to_owned(), Value::String(code.as_str().into()));
                raw.insert("message".to_owned(), Value::String(message.as_str().into()));
            }
        }
        raw
    }

    pub fn from_raw(raw: &RawMessage) -> Result<Self, MessageError> {
        let (operate, request_id, payload) = parse_common(raw)?;
        let status = match required_str(raw, "status")? {
            "ok" => ResultStatus::Ok,
            "error" => {
                let code = FailureCode::parse(required_str(raw, "code")?).ok_or(
                    MessageError::InvalidFieldType {
                        field: "code",
                        expected: "failure code",
                    },
                )?;
                ResultStatus::Error {
                    code,
                    message: required_str(raw, "message")?.to_owned(),
                }
            }
            _ => {
                return Err(MessageError::InvalidFieldType {
                    field: "status",
                    expected: "\"ok\" or \"error\"",
                })
            }
        };

        Ok(Self {
            operate,
            request_id,
            status,
            payload,
        })
    }

    /// Wraps the result into a `COMMAND` envelope frame for write-back.
    pub fn to_frame(&self, codec: &WireCodec) -> Result<Vec<u8>, CodecError> {
        let body = encode_body(&self.to_raw())?;
        codec.encode_frame(&Envelope::command(body).into_raw())
    }

    pub fn from_frame(codec: &WireCodec, frame: &[u8]) -> Result<Self, MessageError> {
        let raw = codec.decode_frame(frame).map_err(MessageError::Codec)?;
        let envelope = Envelope::from_raw(&raw).map_err(MessageError::Envelope)?;
        let body = decode_body(&envelope.body).map_err(MessageError::Codec)?;
        Self::from_raw(&body)
    }
}

pub fn payload_str<'a>(payload: &'a PayloadMap, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

pub fn payload_i64(payload: &PayloadMap, key: &str) -> Option<i64> {
    payload.get(key).and_then(Value::as_i64)
}

pub fn payload_string_list(payload: &PayloadMap, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub fn string_value(text: impl Into<String>) -> Value {
    Value::String(text.into().into())
}

fn parse_common(raw: &RawMessage) -> Result<(i64, String, PayloadMap), MessageError> {
    let operate = required_i64(raw, "op").map_err(|error| match error {
        EnvelopeError::MissingField { field } => MessageError::MissingField { field },
        _ => MessageError::InvalidFieldType {
            field: "op",
            expected: "int64",
        },
    })?;
    let request_id = required_str(raw, "rid")?.to_owned();

    let payload = match raw.get("p") {
        None | Some(Value::Nil) => PayloadMap::new(),
        Some(Value::Map(entries)) => {
            let mut payload = PayloadMap::new();
            for (key, value) in entries {
                let key = key.as_str().ok_or(MessageError::InvalidFieldType {
                    field: "p",
                    expected: "map with string keys",
                })?;
                payload.insert(key.to_owned(), value.clone());
            }
            payload
        }
        Some(_) => {
            return Err(MessageError::InvalidFieldType {
                field: "p",
                expected: "map",
            })
        }
    };

    Ok((operate, request_id, payload))
}

fn required_str<'a>(raw: &'a RawMessage, field: &'static str) -> Result<&'a str, MessageError> {
    raw.get(field)
        .ok_or(MessageError::MissingField { field })?
        .as_str()
        .ok_or(MessageError::InvalidFieldType {
            field,
            expected: "string",
        })
}

fn common_raw(operate: i64, request_id: &str, payload: &PayloadMap) -> RawMessage {
    let mut raw = RawMessage::new();
    raw.insert("op".to_owned(), Value::Integer(operate.into()));
    raw.insert("rid".to_owned(), string_value(request_id));
    raw.insert(
        "p".to_owned(),
        Value::Map(
            payload
                .iter()
                .map(|(key, value)| (string_value(key.as_str()), value.clone()))
                .collect(),
        ),
    );
    raw
}
