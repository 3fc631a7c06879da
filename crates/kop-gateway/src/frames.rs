//! Event-stream frames pushed by the gateway over the websocket.
//!
//! Every frame is `{"type": "<name>", "payload": {...}}`. Unknown types and
//! sub-delivery acks are ignored.

use chrono::{DateTime, TimeZone, Utc};
use kop_core::{
    domain::{ChatAddress, Credentials, MessageId},
    transport::{DisconnectReason, InboundEnvelope, MessageBody, TransportEvent},
};
use serde::Deserialize;

/// Ack level at which the message reached the recipient's device.
const ACK_DELIVERED: i64 = 2;

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct QrPayload {
    code: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthenticatedPayload {
    #[serde(default)]
    credentials: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReadyPayload {
    /// Own address, `6281…@c.us`.
    #[serde(default)]
    me: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReasonPayload {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    id: String,
    from: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    from_me: bool,
    /// Unix seconds.
    #[serde(default)]
    timestamp: i64,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    selected_button_id: Option<String>,
}

fn default_kind() -> String {
    "chat".to_string()
}

#[derive(Debug, Deserialize)]
struct AckPayload {
    id: String,
    ack: i64,
}

/// Decode one text frame. `Ok(None)` for frames with no transport meaning.
pub fn parse_frame(text: &str) -> Result<Option<TransportEvent>, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let event = match raw.kind.as_str() {
        "qr" => {
            let p: QrPayload = serde_json::from_value(raw.payload)?;
            TransportEvent::PairingChallenge { code: p.code }
        }
        "authenticated" => {
            let p: AuthenticatedPayload = payload_or_default(raw.payload)?;
            TransportEvent::Authenticated {
                credentials: p.credentials.map(|token| Credentials { token }),
            }
        }
        "ready" => {
            let p: ReadyPayload = payload_or_default(raw.payload)?;
            TransportEvent::Ready {
                principal: p
                    .me
                    .map(|me| ChatAddress(me).user_part().to_string())
                    .filter(|s| !s.is_empty()),
            }
        }
        "disconnected" => {
            let p: ReasonPayload = payload_or_default(raw.payload)?;
            TransportEvent::Disconnected {
                reason: DisconnectReason::parse(&p.reason),
            }
        }
        "auth_failure" => {
            let p: ReasonPayload = payload_or_default(raw.payload)?;
            TransportEvent::AuthFailure { reason: p.reason }
        }
        "message" => {
            let p: MessagePayload = serde_json::from_value(raw.payload)?;
            TransportEvent::Message(envelope(p))
        }
        "ack" => {
            let p: AckPayload = serde_json::from_value(raw.payload)?;
            if p.ack < ACK_DELIVERED {
                return Ok(None);
            }
            TransportEvent::Delivered {
                message_id: MessageId(p.id),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn payload_or_default<T>(v: serde_json::Value) -> Result<T, serde_json::Error>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if v.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(v)
    }
}

fn envelope(p: MessagePayload) -> InboundEnvelope {
    let MessagePayload {
        id,
        from,
        author,
        from_me,
        timestamp,
        kind,
        body,
        caption,
        mimetype,
        selected_button_id,
    } = p;

    let body = match kind.as_str() {
        "chat" | "text" => MessageBody::Text(body),
        "image" | "video" | "document" => MessageBody::MediaWithCaption {
            mime: mimetype.unwrap_or_else(|| kind.clone()),
            caption: caption.or_else(|| Some(body).filter(|b| !b.is_empty())),
        },
        "buttons_response" | "list_response" | "template_button_reply" => {
            MessageBody::ButtonReply {
                button_id: selected_button_id.unwrap_or_default(),
                display_text: body,
            }
        }
        _ => MessageBody::Unsupported { kind: kind.clone() },
    };
    InboundEnvelope {
        id: MessageId(id),
        from: ChatAddress(from),
        author: author.map(ChatAddress),
        from_me,
        timestamp: unix_seconds(timestamp),
        body,
    }
}

fn unix_seconds(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}
