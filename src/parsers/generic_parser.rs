use serde_json::Value;

use crate::db::{Channel, ChannelProvider};

use super::common::{AdapterError, Attachment, ChannelAdapter, InboundEvent, PayloadUtils};

/// Provider-neutral JSON: a single message object, an array of them, or
/// `{"messages": [...]}`.
///
/// ```json
/// {"from": "+15551234567", "name": "Ada", "text": "hi", "id": "msg-1",
///  "timestamp": "2024-01-01T00:00:00Z", "metadata": {"source": "web"}}
/// ```
pub struct GenericAdapter;

impl GenericAdapter {
    fn to_event(
        channel: &Channel,
        event_type: &str,
        item: &Value,
    ) -> Result<InboundEvent, AdapterError> {
        if !item.is_object() {
            return Err(AdapterError::Malformed(
                "message entry must be a JSON object".to_string(),
            ));
        }

        let phone = PayloadUtils::str_field(item, "from")
            .or_else(|| PayloadUtils::str_field(item, "phone"))
            .ok_or_else(|| AdapterError::Malformed("missing sender phone".to_string()))?;

        let mut event = InboundEvent::new(channel.id, event_type, phone);
        event.sender_name = PayloadUtils::string_field(item, "name");
        event.sender_email = PayloadUtils::string_field(item, "email");
        event.body = PayloadUtils::string_field(item, "text")
            .or_else(|| PayloadUtils::string_field(item, "body"));
        event.external_id = PayloadUtils::string_field(item, "id")
            .or_else(|| PayloadUtils::string_field(item, "message_id"));
        event.timestamp = PayloadUtils::parse_timestamp(item.get("timestamp").unwrap_or(&Value::Null))?;

        if let Some(raw) = item.get("attachments") {
            let attachments: Vec<Attachment> = serde_json::from_value(raw.clone())
                .map_err(|e| AdapterError::Malformed(format!("attachments: {e}")))?;
            event.attachments = attachments;
        }

        event.message_type = PayloadUtils::string_field(item, "type").unwrap_or_else(|| {
            match (&event.body, event.attachments.first()) {
                (None, Some(attachment)) => attachment.kind.clone(),
                _ => "text".to_string(),
            }
        });

        match item.get("metadata") {
            None | Some(Value::Null) => {}
            Some(Value::Object(metadata)) => event.metadata = metadata.clone(),
            Some(_) => {
                return Err(AdapterError::Malformed(
                    "metadata must be a JSON object".to_string(),
                ));
            }
        }

        Ok(event)
    }
}

impl ChannelAdapter for GenericAdapter {
    fn provider(&self) -> ChannelProvider {
        ChannelProvider::Generic
    }

    fn normalize(
        &self,
        channel: &Channel,
        event_type: &str,
        payload: &Value,
    ) -> Result<Vec<InboundEvent>, AdapterError> {
        let items = match payload {
            Value::Array(items) => items.as_slice(),
            Value::Object(object) => match object.get("messages") {
                Some(Value::Array(items)) => items.as_slice(),
                Some(_) => {
                    return Err(AdapterError::Malformed(
                        "messages must be an array".to_string(),
                    ));
                }
                None => std::slice::from_ref(payload),
            },
            _ => {
                return Err(AdapterError::Malformed(
                    "payload must be a JSON object or array".to_string(),
                ));
            }
        };

        items
            .iter()
            .map(|item| Self::to_event(channel, event_type, item))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::GenericAdapter;
    use crate::db::{Channel, ChannelProvider, ChannelStatus};
    use crate::parsers::common::{AdapterError, ChannelAdapter};

    fn channel() -> Channel {
        Channel {
            id: 5,
            company_id: 1,
            name: "web chat".to_string(),
            provider: ChannelProvider::Generic,
            external_id: None,
            status: ChannelStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn single_object_payload() {
        let payload = json!({
            "from": "+1 (555) 123-4567",
            "name": "Ada",
            "text": "hello",
            "id": "msg-1",
            "timestamp": "2024-01-01T00:00:00Z",
            "metadata": {"source": "web", "plan": "gold"}
        });

        let events = GenericAdapter
            .normalize(&channel(), "message", &payload)
            .expect("normalize");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.sender_phone, "+1 (555) 123-4567");
        assert_eq!(event.body.as_deref(), Some("hello"));
        assert_eq!(event.external_id.as_deref(), Some("msg-1"));
        assert_eq!(event.message_type, "text");
        assert_eq!(event.metadata.get("plan"), Some(&json!("gold")));
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn batched_payload_keeps_order() {
        let payload = json!({
            "messages": [
                {"from": "+15550001", "text": "first", "id": "a"},
                {"from": "+15550001", "text": "second", "id": "b"}
            ]
        });
        let events = GenericAdapter
            .normalize(&channel(), "message", &payload)
            .expect("normalize");
        let ids: Vec<_> = events.iter().filter_map(|e| e.external_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn attachment_only_message_takes_attachment_kind() {
        let payload = json!({
            "from": "+15550001",
            "attachments": [{"kind": "image", "url": "https://cdn.example.com/a.jpg"}]
        });
        let events = GenericAdapter
            .normalize(&channel(), "message", &payload)
            .expect("normalize");
        assert_eq!(events[0].message_type, "image");
        assert!(events[0].has_attachments());
    }

    #[test]
    fn missing_sender_is_malformed() {
        assert!(matches!(
            GenericAdapter.normalize(&channel(), "message", &json!({"text": "hi"})),
            Err(AdapterError::Malformed(_))
        ));
        assert!(matches!(
            GenericAdapter.normalize(&channel(), "message", &json!("hi")),
            Err(AdapterError::Malformed(_))
        ));
    }
}
