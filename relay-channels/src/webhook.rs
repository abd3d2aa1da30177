use crate::traits::WebhookDecoder;
use crate::types::{InboundMessage, ReplyToken};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

pub const LINE_SIGNATURE_HEADER: &str = "x-line-signature";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing x-line-signature header")]
    MissingSignature,

    #[error("invalid x-line-signature header")]
    InvalidSignature,

    #[error("invalid webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Verifies `x-line-signature` against the channel secret and decodes
/// text-message events.
#[derive(Clone)]
pub struct LineWebhookDecoder {
    channel_secret: String,
}

impl LineWebhookDecoder {
    pub fn new(channel_secret: &str) -> Self {
        Self {
            channel_secret: channel_secret.to_string(),
        }
    }

    fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), WebhookError> {
        let signature = signature
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(WebhookError::MissingSignature)?;
        let signature_bytes = BASE64
            .decode(signature)
            .map_err(|_| WebhookError::InvalidSignature)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(self.channel_secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(body);
        mac.verify_slice(&signature_bytes)
            .map_err(|_| WebhookError::InvalidSignature)
    }
}

impl WebhookDecoder for LineWebhookDecoder {
    fn verify_and_decode(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Vec<InboundMessage>, WebhookError> {
        self.verify(body, signature)?;
        let payload: LineWebhookPayload = serde_json::from_slice(body)?;
        Ok(payload
            .events
            .into_iter()
            .filter_map(convert_line_event)
            .collect())
    }
}

/// Base64 HMAC-SHA256 of `body` keyed by the channel secret, as LINE sends it.
pub fn sign_body(channel_secret: &str, body: &[u8]) -> String {
    // HMAC takes keys of any length, so construction cannot fail.
    let mut mac = match Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

fn convert_line_event(event: LineEvent) -> Option<InboundMessage> {
    if event.event_type != "message" {
        return None;
    }
    let message = event.message?;
    if message.message_type != "text" {
        return None;
    }
    let reply_token = event.reply_token.filter(|t| !t.trim().is_empty())?;
    let source = event.source?;
    let sender = source.user_id.clone().filter(|id| !id.trim().is_empty());
    let conversation = source
        .group_id
        .or(source.room_id)
        .or_else(|| sender.clone())
        .filter(|id| !id.trim().is_empty())?;
    let message_id = if message.id.trim().is_empty() {
        ulid::Ulid::new().to_string()
    } else {
        message.id
    };

    Some(InboundMessage {
        message_id: message_id.into(),
        conversation_id: conversation.into(),
        sender_id: sender.unwrap_or_default().into(),
        text: message.text.unwrap_or_default(),
        reply_token: ReplyToken::new(reply_token),
        received_at: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct LineWebhookPayload {
    #[serde(default)]
    events: Vec<LineEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    reply_token: Option<String>,
    #[serde(default)]
    source: Option<LineSource>,
    #[serde(default)]
    message: Option<LineMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineSource {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<String>,
}
