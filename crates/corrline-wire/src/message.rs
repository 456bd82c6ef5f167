use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The three tags that ever appear on the wire. An absent `type` field is
/// resolved to `Data` during validation — see [`crate::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "fin")]
    Finish,
    #[serde(rename = "err")]
    Error,
}

impl MessageType {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            MessageType::Data => "data",
            MessageType::Finish => "fin",
            MessageType::Error => "err",
        }
    }
}

/// `error.type` + `error.message` carried on an `Error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl MessageError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Routing + metadata shared by every frame of a correspondence.
///
/// Unrecognized fields round-trip via `extra` rather than being dropped —
/// a header annotated by one peer should survive a hop through code that
/// only understands `correspondenceId`/`subject`/`authorization`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "correspondenceId")]
    pub correspondence_id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageHeader {
    pub fn new(correspondence_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            correspondence_id: correspondence_id.into(),
            subject: subject.into(),
            authorization: None,
            extra: Map::new(),
        }
    }

    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }
}

/// A single frame, already validated. `kind` is always resolved — there is
/// no runtime "absent type" state past the codec boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub header: MessageHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

impl Message {
    pub fn data(header: MessageHeader, body: Option<Value>) -> Self {
        Self {
            kind: MessageType::Data,
            header,
            body,
            error: None,
        }
    }

    pub fn finish(header: MessageHeader, body: Option<Value>) -> Self {
        Self {
            kind: MessageType::Finish,
            header,
            body,
            error: None,
        }
    }

    pub fn error(header: MessageHeader, error: MessageError) -> Self {
        Self {
            kind: MessageType::Error,
            header,
            body: None,
            error: Some(error),
        }
    }
}

/// The wire shape, deserialized generously so that validation can report
/// precise reasons rather than a blanket serde error.
#[derive(Debug, Deserialize)]
pub(crate) struct RawMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<MessageType>,
    #[serde(default)]
    pub header: Option<Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("header is missing or not an object")]
    MissingHeader,
    #[error("header.correspondenceId is missing or empty")]
    MissingCorrespondenceId,
    #[error("header.subject is missing or empty")]
    MissingSubject,
    #[error("error field is required when type is \"err\"")]
    MissingError,
    #[error("error.type or error.message is missing or empty")]
    InvalidError,
    #[error("header field did not deserialize cleanly: {0}")]
    MalformedHeader(String),
}

/// Validates a [`RawMessage`] into a fully-resolved [`Message`].
///
/// Absent `type` resolves to [`MessageType::Data`] unconditionally, per the
/// recommended rule for the "absent type" design question.
pub(crate) fn validate(raw: RawMessage) -> Result<Message, ValidationError> {
    let header_value = raw.header.ok_or(ValidationError::MissingHeader)?;
    if !header_value.is_object() {
        return Err(ValidationError::MissingHeader);
    }
    let header: MessageHeader = serde_json::from_value(header_value)
        .map_err(|e| ValidationError::MalformedHeader(e.to_string()))?;
    if header.correspondence_id.is_empty() {
        return Err(ValidationError::MissingCorrespondenceId);
    }
    if header.subject.is_empty() {
        return Err(ValidationError::MissingSubject);
    }

    let kind = raw.kind.unwrap_or(MessageType::Data);

    let error = match kind {
        MessageType::Error => {
            let error_value = raw.error.ok_or(ValidationError::MissingError)?;
            let error: MessageError = serde_json::from_value(error_value)
                .map_err(|_| ValidationError::InvalidError)?;
            if error.kind.is_empty() || error.message.is_empty() {
                return Err(ValidationError::InvalidError);
            }
            Some(error)
        }
        _ => None,
    };

    let body = if matches!(kind, MessageType::Error) {
        None
    } else {
        raw.body
    };

    Ok(Message {
        kind,
        header,
        body,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_from_str(s: &str) -> RawMessage {
        serde_json::from_str(s).expect("valid json")
    }

    #[test]
    fn absent_type_resolves_to_data() {
        let raw = raw_from_str(r#"{"header":{"correspondenceId":"c1","subject":"login"},"body":{"ok":true}}"#);
        let msg = validate(raw).unwrap();
        assert_eq!(msg.kind, MessageType::Data);
        assert_eq!(msg.body, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn missing_correspondence_id_is_rejected() {
        let raw = raw_from_str(r#"{"header":{"correspondenceId":"","subject":"login"}}"#);
        assert_eq!(validate(raw).unwrap_err(), ValidationError::MissingCorrespondenceId);
    }

    #[test]
    fn missing_subject_is_rejected() {
        let raw = raw_from_str(r#"{"header":{"correspondenceId":"c1","subject":""}}"#);
        assert_eq!(validate(raw).unwrap_err(), ValidationError::MissingSubject);
    }

    #[test]
    fn error_frame_requires_error_body() {
        let raw = raw_from_str(r#"{"type":"err","header":{"correspondenceId":"c1","subject":"login"}}"#);
        assert_eq!(validate(raw).unwrap_err(), ValidationError::MissingError);
    }

    #[test]
    fn error_frame_ignores_body_field() {
        let raw = raw_from_str(
            r#"{"type":"err","header":{"correspondenceId":"c1","subject":"login"},"body":{"leftover":true},"error":{"type":"Bad","message":"nope"}}"#,
        );
        let msg = validate(raw).unwrap();
        assert!(msg.body.is_none());
        assert_eq!(msg.error.unwrap().kind, "Bad");
    }

    #[test]
    fn extra_header_fields_round_trip() {
        let header: MessageHeader = serde_json::from_str(
            r#"{"correspondenceId":"c1","subject":"login","trace":"abc123"}"#,
        )
        .unwrap();
        assert_eq!(header.extra.get("trace").unwrap(), "abc123");
        let encoded = serde_json::to_string(&header).unwrap();
        assert!(encoded.contains("\"trace\":\"abc123\""));
    }

    #[test]
    fn finish_with_body_serializes_as_single_fin_frame() {
        let header = MessageHeader::new("c1", "login");
        let msg = Message::finish(header, Some(serde_json::json!({"bye": true})));
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"fin\""));
        assert!(encoded.contains("\"bye\":true"));
        assert!(!encoded.contains("\"error\""));
    }
}
