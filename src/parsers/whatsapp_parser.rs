use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::db::{Channel, ChannelProvider};

use super::common::{AdapterError, Attachment, ChannelAdapter, InboundEvent, PayloadUtils};

#[derive(Debug, Deserialize)]
struct CloudWebhook {
    object: String,
    #[serde(default)]
    entry: Vec<CloudEntry>,
}

#[derive(Debug, Deserialize)]
struct CloudEntry {
    #[serde(default)]
    changes: Vec<CloudChange>,
}

#[derive(Debug, Deserialize)]
struct CloudChange {
    field: String,
    value: CloudValue,
}

#[derive(Debug, Default, Deserialize)]
struct CloudValue {
    #[serde(default)]
    metadata: CloudMetadata,
    #[serde(default)]
    contacts: Vec<CloudContact>,
    #[serde(default)]
    messages: Vec<CloudMessage>,
    #[serde(default)]
    statuses: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CloudMetadata {
    display_phone_number: Option<String>,
    phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudContact {
    wa_id: String,
    #[serde(default)]
    profile: Option<CloudProfile>,
}

#[derive(Debug, Deserialize)]
struct CloudProfile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CloudMessage {
    id: String,
    from: String,
    #[serde(default)]
    timestamp: Value,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    text: Option<CloudText>,
    #[serde(default)]
    image: Option<CloudMedia>,
    #[serde(default)]
    audio: Option<CloudMedia>,
    #[serde(default)]
    video: Option<CloudMedia>,
    #[serde(default)]
    document: Option<CloudMedia>,
    #[serde(default)]
    sticker: Option<CloudMedia>,
    #[serde(default)]
    location: Option<CloudLocation>,
    #[serde(default)]
    interactive: Option<CloudInteractive>,
    #[serde(default)]
    button: Option<CloudButton>,
}

#[derive(Debug, Deserialize)]
struct CloudText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct CloudMedia {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudLocation {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudInteractive {
    #[serde(rename = "type")]
    interactive_type: String,
    #[serde(default)]
    button_reply: Option<CloudReply>,
    #[serde(default)]
    list_reply: Option<CloudReply>,
}

#[derive(Debug, Deserialize)]
struct CloudReply {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct CloudButton {
    payload: String,
    text: String,
}

/// WhatsApp Cloud API `whatsapp_business_account` webhooks.
pub struct WhatsAppAdapter;

impl WhatsAppAdapter {
    fn media(message: &CloudMessage) -> Option<&CloudMedia> {
        match message.message_type.as_str() {
            "image" => message.image.as_ref(),
            "audio" => message.audio.as_ref(),
            "video" => message.video.as_ref(),
            "document" => message.document.as_ref(),
            "sticker" => message.sticker.as_ref(),
            _ => None,
        }
    }

    fn to_event(
        channel: &Channel,
        event_type: &str,
        value: &CloudValue,
        message: &CloudMessage,
    ) -> Result<InboundEvent, AdapterError> {
        let mut event = InboundEvent::new(channel.id, event_type, &message.from);
        event.external_id = Some(message.id.clone());
        event.message_type = message.message_type.clone();
        event.timestamp = PayloadUtils::parse_timestamp(&message.timestamp)?;
        event.sender_name = value
            .contacts
            .iter()
            .find(|contact| contact.wa_id == message.from)
            .or_else(|| value.contacts.first())
            .and_then(|contact| contact.profile.as_ref())
            .map(|profile| profile.name.clone());

        if let Some(id) = &value.metadata.phone_number_id {
            event
                .metadata
                .insert("phone_number_id".to_string(), Value::String(id.clone()));
        }
        if let Some(number) = &value.metadata.display_phone_number {
            event.metadata.insert(
                "display_phone_number".to_string(),
                Value::String(number.clone()),
            );
        }

        match message.message_type.as_str() {
            "text" => {
                event.body = message.text.as_ref().map(|text| text.body.clone());
            }
            "interactive" => {
                if let Some(interactive) = &message.interactive {
                    let reply = match interactive.interactive_type.as_str() {
                        "button_reply" => interactive.button_reply.as_ref(),
                        "list_reply" => interactive.list_reply.as_ref(),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        event.body = Some(reply.title.clone());
                        event
                            .metadata
                            .insert("reply_id".to_string(), Value::String(reply.id.clone()));
                    }
                }
            }
            "button" => {
                if let Some(button) = &message.button {
                    event.body = Some(button.text.clone());
                    event.metadata.insert(
                        "reply_id".to_string(),
                        Value::String(button.payload.clone()),
                    );
                }
            }
            "location" => {
                if let Some(location) = &message.location {
                    event.body = location.name.clone();
                    event.metadata.insert(
                        "latitude".to_string(),
                        Value::from(location.latitude),
                    );
                    event.metadata.insert(
                        "longitude".to_string(),
                        Value::from(location.longitude),
                    );
                }
            }
            _ => {
                if let Some(media) = Self::media(message) {
                    event.body = media.caption.clone();
                    event.attachments.push(Attachment {
                        kind: message.message_type.clone(),
                        media_id: Some(media.id.clone()),
                        url: None,
                        mime_type: media.mime_type.clone(),
                        caption: media.caption.clone(),
                    });
                }
            }
        }

        Ok(event)
    }
}

impl ChannelAdapter for WhatsAppAdapter {
    fn provider(&self) -> ChannelProvider {
        ChannelProvider::WhatsApp
    }

    fn normalize(
        &self,
        channel: &Channel,
        event_type: &str,
        payload: &Value,
    ) -> Result<Vec<InboundEvent>, AdapterError> {
        let webhook: CloudWebhook = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Malformed(format!("whatsapp webhook: {e}")))?;
        if webhook.object != "whatsapp_business_account" {
            return Err(AdapterError::UnsupportedProvider(format!(
                "unexpected object {}",
                webhook.object
            )));
        }

        let mut events = Vec::new();
        for change in webhook.entry.iter().flat_map(|entry| entry.changes.iter()) {
            if change.field != "messages" {
                debug!("skipping whatsapp change field={}", change.field);
                continue;
            }

            if let (Some(expected), Some(found)) = (
                channel.external_id.as_deref(),
                change.value.metadata.phone_number_id.as_deref(),
            ) {
                if expected != found {
                    return Err(AdapterError::Malformed(format!(
                        "payload addressed to phone number id {found}, channel {} expects {expected}",
                        channel.id
                    )));
                }
            }

            if !change.value.statuses.is_empty() {
                debug!(
                    "skipping {} whatsapp status receipts on channel_id={}",
                    change.value.statuses.len(),
                    channel.id
                );
            }

            for message in &change.value.messages {
                events.push(Self::to_event(channel, event_type, &change.value, message)?);
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{Value, json};

    use super::WhatsAppAdapter;
    use crate::db::{Channel, ChannelProvider, ChannelStatus};
    use crate::parsers::common::{AdapterError, ChannelAdapter};

    fn channel(external_id: Option<&str>) -> Channel {
        Channel {
            id: 11,
            company_id: 1,
            name: "support line".to_string(),
            provider: ChannelProvider::WhatsApp,
            external_id: external_id.map(str::to_string),
            status: ChannelStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn webhook(messages: Value, statuses: Value) -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "15550000000",
                            "phone_number_id": "PN-1"
                        },
                        "contacts": [{"wa_id": "15551234567", "profile": {"name": "Ada"}}],
                        "messages": messages,
                        "statuses": statuses
                    }
                }]
            }]
        })
    }

    #[test]
    fn text_message_is_normalized() {
        let payload = webhook(
            json!([{
                "id": "wamid.A",
                "from": "15551234567",
                "timestamp": "1700000000",
                "type": "text",
                "text": {"body": "I need help with my order"}
            }]),
            json!([]),
        );

        let events = WhatsAppAdapter
            .normalize(&channel(Some("PN-1")), "message", &payload)
            .expect("normalize");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.channel_id, 11);
        assert_eq!(event.sender_phone, "15551234567");
        assert_eq!(event.sender_name.as_deref(), Some("Ada"));
        assert_eq!(event.body.as_deref(), Some("I need help with my order"));
        assert_eq!(event.external_id.as_deref(), Some("wamid.A"));
        assert_eq!(event.timestamp.map(|ts| ts.timestamp()), Some(1_700_000_000));
        assert_eq!(event.metadata.get("phone_number_id"), Some(&json!("PN-1")));
    }

    #[test]
    fn media_and_interactive_messages_are_normalized() {
        let payload = webhook(
            json!([
                {
                    "id": "wamid.B",
                    "from": "15551234567",
                    "timestamp": "1700000001",
                    "type": "image",
                    "image": {"id": "MEDIA-1", "mime_type": "image/jpeg", "caption": "receipt"}
                },
                {
                    "id": "wamid.C",
                    "from": "15551234567",
                    "timestamp": "1700000002",
                    "type": "interactive",
                    "interactive": {
                        "type": "button_reply",
                        "button_reply": {"id": "talk_to_agent", "title": "Talk to an agent"}
                    }
                }
            ]),
            json!([]),
        );

        let events = WhatsAppAdapter
            .normalize(&channel(None), "message", &payload)
            .expect("normalize");
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].message_type, "image");
        assert!(events[0].has_attachments());
        assert_eq!(events[0].attachments[0].media_id.as_deref(), Some("MEDIA-1"));
        assert_eq!(events[0].body.as_deref(), Some("receipt"));

        assert_eq!(events[1].body.as_deref(), Some("Talk to an agent"));
        assert_eq!(events[1].metadata.get("reply_id"), Some(&json!("talk_to_agent")));
    }

    #[test]
    fn status_receipts_produce_no_events() {
        let payload = webhook(
            json!([]),
            json!([{"id": "wamid.A", "status": "delivered", "timestamp": "1700000003", "recipient_id": "15551234567"}]),
        );
        let events = WhatsAppAdapter
            .normalize(&channel(None), "message", &payload)
            .expect("normalize");
        assert!(events.is_empty());
    }

    #[test]
    fn foreign_phone_number_id_is_rejected() {
        let payload = webhook(
            json!([{
                "id": "wamid.D",
                "from": "15551234567",
                "timestamp": "1700000000",
                "type": "text",
                "text": {"body": "hi"}
            }]),
            json!([]),
        );
        assert!(matches!(
            WhatsAppAdapter.normalize(&channel(Some("PN-2")), "message", &payload),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn non_whatsapp_object_is_unsupported() {
        let payload = json!({"object": "page", "entry": []});
        assert!(matches!(
            WhatsAppAdapter.normalize(&channel(None), "message", &payload),
            Err(AdapterError::UnsupportedProvider(_))
        ));
    }

    #[test]
    fn missing_object_is_malformed() {
        assert!(matches!(
            WhatsAppAdapter.normalize(&channel(None), "message", &json!({"entry": []})),
            Err(AdapterError::Malformed(_))
        ));
    }
}
