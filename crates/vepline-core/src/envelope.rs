//! Self-describing event envelope carried on every bus lane.
//!
//! The wire form is the CloudEvents 1.0 structured JSON layout: context
//! attributes at the top level, extension attributes flattened beside them,
//! and the payload under `data` (JSON content types) or `data_base64`
//! (anything else). Decoding is lenient about what it does not need:
//! unknown attributes become extensions and optional ones take defaults.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::EnvelopeError;
use crate::ids::{CorrelationId, EnvelopeId};
use crate::mode::ProcessingMode;

pub const SPEC_VERSION: &str = "1.0";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Extension attribute keys.
pub mod ext {
    pub const CORRELATION_ID: &str = "correlationId";
    pub const PROCESSING_MODE: &str = "processingMode";
    pub const PAYLOAD_LENGTH: &str = "payloadLength";
    pub const RESOURCE_PROFILE: &str = "resourceProfile";
    pub const ERROR_TYPE: &str = "errorType";
}

const RESERVED: [&str; 9] = [
    "specversion",
    "id",
    "source",
    "type",
    "subject",
    "time",
    "datacontenttype",
    "data",
    "data_base64",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub content_type: String,
    pub data: Bytes,
}

impl Payload {
    pub fn json(value: &Value) -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            data: Bytes::from(value.to_string()),
        }
    }

    pub fn is_json(&self) -> bool {
        self.content_type.starts_with(JSON_CONTENT_TYPE) || self.content_type.ends_with("+json")
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            data: Bytes::new(),
        }
    }
}

/// Immutable once built. Each hop builds a new envelope rather than
/// editing the one it received.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    id: EnvelopeId,
    event_type: String,
    source: String,
    subject: String,
    time: DateTime<Utc>,
    extensions: BTreeMap<String, String>,
    payload: Payload,
}

impl EventEnvelope {
    pub fn builder(event_type: impl Into<String>, source: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(event_type, source)
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.extension(ext::CORRELATION_ID)
            .filter(|s| !s.is_empty())
            .map(CorrelationId::from_raw)
    }

    /// Missing or unrecognized mode tags resolve to `Standard`.
    pub fn processing_mode(&self) -> ProcessingMode {
        ProcessingMode::resolve(self.extension(ext::PROCESSING_MODE)).0
    }

    pub fn payload_length(&self) -> Option<usize> {
        self.extension(ext::PAYLOAD_LENGTH)?.parse().ok()
    }

    /// Serialize to the structured JSON wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut obj = Map::new();
        obj.insert("specversion".into(), Value::from(SPEC_VERSION));
        obj.insert("id".into(), Value::from(self.id.as_str()));
        obj.insert("source".into(), Value::from(self.source.as_str()));
        obj.insert("type".into(), Value::from(self.event_type.as_str()));
        obj.insert("subject".into(), Value::from(self.subject.as_str()));
        obj.insert("time".into(), Value::from(self.time.to_rfc3339()));
        obj.insert(
            "datacontenttype".into(),
            Value::from(self.payload.content_type.as_str()),
        );
        for (key, value) in &self.extensions {
            if !RESERVED.contains(&key.as_str()) {
                obj.insert(key.clone(), Value::from(value.as_str()));
            }
        }

        let embedded = if self.payload.is_json() {
            serde_json::from_slice::<Value>(&self.payload.data).ok()
        } else {
            None
        };
        match embedded {
            Some(value) => {
                obj.insert("data".into(), value);
            }
            None if !self.payload.data.is_empty() => {
                obj.insert("data_base64".into(), Value::from(BASE64.encode(&self.payload.data)));
            }
            None => {}
        }

        Value::Object(obj).to_string().into_bytes()
    }

    /// Parse the structured JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::Malformed("envelope is not a JSON object".into()));
        };

        let id = take_string(&mut obj, "id").ok_or(EnvelopeError::MissingAttribute("id"))?;
        let source =
            take_string(&mut obj, "source").ok_or(EnvelopeError::MissingAttribute("source"))?;
        let event_type =
            take_string(&mut obj, "type").ok_or(EnvelopeError::MissingAttribute("type"))?;
        let subject = take_string(&mut obj, "subject").unwrap_or_default();
        let time = match take_string(&mut obj, "time") {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| EnvelopeError::Malformed(format!("time: {e}")))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };
        let content_type =
            take_string(&mut obj, "datacontenttype").unwrap_or_else(|| JSON_CONTENT_TYPE.into());
        obj.remove("specversion");

        let data = match (obj.remove("data_base64"), obj.remove("data")) {
            (Some(Value::String(b64)), _) => Bytes::from(
                BASE64
                    .decode(b64.as_bytes())
                    .map_err(|e| EnvelopeError::InvalidData(e.to_string()))?,
            ),
            (_, Some(Value::String(text))) if !content_type.contains("json") => Bytes::from(text),
            (_, Some(Value::Null)) | (_, None) => Bytes::new(),
            (_, Some(other)) => Bytes::from(other.to_string()),
        };

        let mut extensions = BTreeMap::new();
        for (key, value) in obj {
            let as_text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                // Structured extension values are not representable; skip them.
                _ => continue,
            };
            extensions.insert(key, as_text);
        }

        Ok(Self {
            id: EnvelopeId::from_raw(id),
            event_type,
            source,
            subject,
            time,
            extensions,
            payload: Payload { content_type, data },
        })
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

pub struct EnvelopeBuilder {
    event_type: String,
    source: String,
    subject: String,
    time: Option<DateTime<Utc>>,
    extensions: BTreeMap<String, String>,
    payload: Payload,
}

impl EnvelopeBuilder {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            subject: String::new(),
            time: None,
            extensions: BTreeMap::new(),
            payload: Payload::default(),
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(self, id: &CorrelationId) -> Self {
        self.extension(ext::CORRELATION_ID, id.as_str())
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn json_payload(self, value: &Value) -> Self {
        self.payload(Payload::json(value))
    }

    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            id: EnvelopeId::new(),
            event_type: self.event_type,
            source: self.source,
            subject: self.subject,
            time: self.time.unwrap_or_else(Utc::now),
            extensions: self.extensions,
            payload: self.payload,
        }
    }
}
