use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    ProtocolError,
    message::{Envelope, Message, Metadata},
};

pub const STATUS_KEY: &str = "status";
pub const STATUS_SUCCESS: &str = "success";
pub const ERROR_CODE_KEY: &str = "error_code";

/// Media type tag carried by error responses.
pub const ERROR_MEDIA_TYPE: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    TooManyRequests,
    Internal,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::Internal => 500,
        }
    }
}

/// Error body sent in place of a processed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_code: u16,
    pub description: String,
    pub solution: String,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, description: impl Into<String>, solution: impl Into<String>) -> Self {
        Self {
            error_code: code.code(),
            description: description.into(),
            solution: solution.into(),
        }
    }

    pub fn metadata(&self) -> Metadata {
        let mut out = Metadata::new();
        out.insert(ERROR_CODE_KEY.into(), json!(self.error_code));
        out.insert("description".into(), json!(self.description));
        out.insert("solution".into(), json!(self.solution));
        out
    }

    pub fn into_message(self) -> Message {
        Message::new(self.metadata(), ERROR_MEDIA_TYPE, Vec::new())
    }
}

/// Metadata of a successful response.
pub fn success_metadata() -> Metadata {
    let mut out = Metadata::new();
    out.insert(STATUS_KEY.into(), json!(STATUS_SUCCESS));
    out
}

/// Outcome reported by the server. The artifact of a successful response is
/// the payload that follows the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success { media_type: String },
    Err(ErrorRecord),
}

impl Response {
    fn classify(
        metadata: &Metadata,
        media_type: &str,
        payload_size: u64,
    ) -> Result<Self, ProtocolError> {
        if metadata.contains_key(ERROR_CODE_KEY) {
            if payload_size != 0 {
                return Err(ProtocolError::MalformedMetadata(
                    "error response carries a payload".into(),
                ));
            }
            let record: ErrorRecord = serde_json::from_value(Value::Object(metadata.clone()))?;
            return Ok(Response::Err(record));
        }

        match metadata.get(STATUS_KEY).and_then(Value::as_str) {
            Some(STATUS_SUCCESS) if payload_size > 0 => Ok(Response::Success {
                media_type: media_type.to_string(),
            }),
            Some(STATUS_SUCCESS) => Err(ProtocolError::MalformedMetadata(
                "success response without a payload".into(),
            )),
            _ => Err(ProtocolError::MalformedMetadata(
                "response is neither success nor error".into(),
            )),
        }
    }
}

impl TryFrom<&Envelope> for Response {
    type Error = ProtocolError;

    fn try_from(value: &Envelope) -> Result<Self, Self::Error> {
        Response::classify(&value.metadata, &value.media_type, value.payload_size)
    }
}

impl TryFrom<&Message> for Response {
    type Error = ProtocolError;

    fn try_from(value: &Message) -> Result<Self, Self::Error> {
        Response::classify(&value.metadata, &value.media_type, value.payload.len() as u64)
    }
}
