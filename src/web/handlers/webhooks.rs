use hmac::{Hmac, Mac};
use salvo::prelude::*;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::ingest::IngestError;
use crate::web::handlers::{render_error, render_tenant_error, state_or_unavailable};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const DEFAULT_EVENT_TYPE: &str = "message";

/// Checks a `sha256=<hex>` header against the HMAC of the raw body.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_digest) = header.and_then(|value| value.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Splits a delivery into `(event_type, payload)`. Accepts the
/// `{"event_type": .., "payload": ..}` envelope or a raw provider payload.
pub fn parse_delivery(body: &[u8]) -> Result<(String, Value), IngestError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| IngestError::Malformed(format!("body is not JSON: {e}")))?;

    let Value::Object(object) = &value else {
        return Ok((DEFAULT_EVENT_TYPE.to_string(), value));
    };
    let is_envelope = object.contains_key("payload")
        && object.keys().all(|key| key == "payload" || key == "event_type");
    if !is_envelope {
        return Ok((DEFAULT_EVENT_TYPE.to_string(), value));
    }

    let event_type = match object.get("event_type") {
        None | Some(Value::Null) => DEFAULT_EVENT_TYPE.to_string(),
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind.trim().to_string(),
        Some(_) => {
            return Err(IngestError::Malformed(
                "event_type must be a non-empty string".to_string(),
            ));
        }
    };
    let payload = object.get("payload").cloned().unwrap_or(Value::Null);
    Ok((event_type, payload))
}

fn ingest_status(err: &IngestError) -> StatusCode {
    match err {
        IngestError::UnknownChannel(_) => StatusCode::NOT_FOUND,
        IngestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
        IngestError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn render_ingest_error(res: &mut Response, err: &IngestError) {
    render_error(res, ingest_status(err), &err.to_string());
}

/// WhatsApp subscription handshake: echo `hub.challenge` when the verify
/// token matches.
#[handler]
pub async fn verify_webhook(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(channel_id) = req.param::<i64>("channel_id") else {
        render_error(res, StatusCode::NOT_FOUND, "unknown channel");
        return;
    };
    if let Err(err) = state.tenants.for_channel(channel_id).await {
        render_tenant_error(res, &err);
        return;
    }

    let mode = req.query::<String>("hub.mode");
    let token = req.query::<String>("hub.verify_token");
    let challenge = req.query::<String>("hub.challenge");
    match (&state.verify_token, mode.as_deref(), token, challenge) {
        (Some(expected), Some("subscribe"), Some(token), Some(challenge)) if *expected == token => {
            debug!("webhook verified for channel_id={}", channel_id);
            res.render(Text::Plain(challenge));
        }
        (None, ..) => {
            render_error(res, StatusCode::FORBIDDEN, "webhook verification is not configured");
        }
        _ => {
            warn!("webhook verification rejected for channel_id={}", channel_id);
            render_error(res, StatusCode::FORBIDDEN, "verification failed");
        }
    }
}

#[handler]
pub async fn receive_webhook(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(channel_id) = req.param::<i64>("channel_id") else {
        render_ingest_error(res, &IngestError::Malformed("channel id must be numeric".to_string()));
        return;
    };

    let signature = req.header::<String>(SIGNATURE_HEADER);
    let body = match req.payload_with_max_size(state.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("unreadable body: {}", err));
            return;
        }
    };

    let signed = state.app_secret.as_ref().is_none_or(|secret| {
        verify_signature(secret.expose_secret().as_bytes(), &body, signature.as_deref())
    });
    if !signed {
        warn!("rejected webhook with bad signature for channel_id={}", channel_id);
        render_ingest_error(res, &IngestError::Unauthorized("bad signature".to_string()));
        return;
    }

    let (event_type, payload) = match parse_delivery(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            render_ingest_error(res, &err);
            return;
        }
    };

    match state.ingestor.receive(channel_id, &event_type, payload).await {
        Ok(receipt) => {
            res.render(Json(json!({
                "ok": true,
                "event_id": receipt.event_id,
            })));
        }
        Err(err) => render_ingest_error(res, &err),
    }
}

#[cfg(test)]
mod tests {
    use hmac::Mac;
    use serde_json::json;
    use test_case::test_case;

    use super::{HmacSha256, parse_delivery, verify_signature};
    use crate::ingest::IngestError;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("key");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"from":"+15550001"}"#;
        let header = sign(b"app-secret", body);
        assert!(verify_signature(b"app-secret", body, Some(&header)));
    }

    #[test]
    fn rejects_signature_from_other_secret() {
        let body = br#"{"from":"+15550001"}"#;
        let header = sign(b"someone-else", body);
        assert!(!verify_signature(b"app-secret", body, Some(&header)));
    }

    #[test_case(None; "missing header")]
    #[test_case(Some("deadbeef"); "missing prefix")]
    #[test_case(Some("sha256=not-hex"); "bad hex")]
    fn rejects_unusable_headers(header: Option<&str>) {
        assert!(!verify_signature(b"app-secret", b"{}", header));
    }

    #[test]
    fn envelope_carries_event_type() {
        let body = json!({"event_type": "status", "payload": {"from": "+1"}}).to_string();
        let (event_type, payload) = parse_delivery(body.as_bytes()).expect("parse");
        assert_eq!(event_type, "status");
        assert_eq!(payload, json!({"from": "+1"}));
    }

    #[test]
    fn raw_payload_defaults_to_message() {
        let body = json!({"object": "whatsapp_business_account", "entry": []}).to_string();
        let (event_type, payload) = parse_delivery(body.as_bytes()).expect("parse");
        assert_eq!(event_type, "message");
        assert_eq!(payload["object"], "whatsapp_business_account");
    }

    #[test]
    fn object_with_payload_and_other_keys_is_raw() {
        let body = json!({"payload": 1, "from": "+1"}).to_string();
        let (_, payload) = parse_delivery(body.as_bytes()).expect("parse");
        assert_eq!(payload, json!({"payload": 1, "from": "+1"}));
    }

    #[test_case(b"not json"; "not json")]
    #[test_case(br#"{"event_type": 5, "payload": {}}"#; "numeric event type")]
    fn rejects_malformed_bodies(body: &[u8]) {
        assert!(matches!(parse_delivery(body), Err(IngestError::Malformed(_))));
    }
}
