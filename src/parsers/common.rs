use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::{Channel, ChannelProvider};

use super::generic_parser::GenericAdapter;
use super::whatsapp_parser::WhatsAppAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unsupported provider payload: {0}")]
    UnsupportedProvider(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// A provider event reduced to what routing needs. One webhook delivery may
/// carry several of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel_id: i64,
    pub event_type: String,
    pub sender_phone: String,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub body: Option<String>,
    pub message_type: String,
    pub attachments: Vec<Attachment>,
    pub external_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

impl InboundEvent {
    pub fn new(channel_id: i64, event_type: &str, sender_phone: &str) -> Self {
        Self {
            channel_id,
            event_type: event_type.to_string(),
            sender_phone: sender_phone.to_string(),
            sender_name: None,
            sender_email: None,
            body: None,
            message_type: "text".to_string(),
            attachments: Vec::new(),
            external_id: None,
            timestamp: None,
            metadata: Map::new(),
        }
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn attachments_json(&self) -> Value {
        serde_json::to_value(&self.attachments).unwrap_or_else(|_| Value::Array(Vec::new()))
    }
}

/// Normalizes a provider's webhook payload into [`InboundEvent`]s. Delivery
/// receipts and other non-conversational notices produce no events.
pub trait ChannelAdapter: Send + Sync {
    fn provider(&self) -> ChannelProvider;

    fn normalize(
        &self,
        channel: &Channel,
        event_type: &str,
        payload: &Value,
    ) -> Result<Vec<InboundEvent>, AdapterError>;
}

static WHATSAPP_ADAPTER: WhatsAppAdapter = WhatsAppAdapter;
static GENERIC_ADAPTER: GenericAdapter = GenericAdapter;

pub fn adapter_for(provider: ChannelProvider) -> &'static dyn ChannelAdapter {
    match provider {
        ChannelProvider::WhatsApp => &WHATSAPP_ADAPTER,
        ChannelProvider::Generic => &GENERIC_ADAPTER,
    }
}

pub struct PayloadUtils;

impl PayloadUtils {
    pub fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn string_field(value: &Value, key: &str) -> Option<String> {
        Self::str_field(value, key).map(str::to_string)
    }

    /// Accepts RFC 3339 strings, unix seconds as a number, or unix seconds
    /// as a numeric string.
    pub fn parse_timestamp(value: &Value) -> Result<Option<DateTime<Utc>>, AdapterError> {
        let seconds = match value {
            Value::Null => return Ok(None),
            Value::Number(number) => number.as_i64(),
            Value::String(raw) if raw.trim().is_empty() => return Ok(None),
            Value::String(raw) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(raw.trim()) {
                    return Ok(Some(parsed.with_timezone(&Utc)));
                }
                raw.trim().parse::<i64>().ok()
            }
            _ => None,
        };

        let seconds = seconds
            .ok_or_else(|| AdapterError::Malformed(format!("invalid timestamp {value}")))?;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .map(Some)
            .ok_or_else(|| AdapterError::Malformed(format!("timestamp {seconds} out of range")))
    }
}
