use crate::types::{ConversationId, InboundMessage, ReplyToken};
use crate::webhook::WebhookError;
use anyhow::Result;
use async_trait::async_trait;

/// Upper bound on messages a single reply call may carry.
pub const MAX_REPLY_MESSAGES: usize = 5;

/// Outbound send primitives of the messaging platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Answer an event. Consumes the token; at most `MAX_REPLY_MESSAGES` texts.
    async fn reply(&self, reply_token: ReplyToken, texts: &[String]) -> Result<()>;

    /// Send one text to a conversation. Repeatable but rate limited upstream.
    async fn push(&self, conversation_id: &ConversationId, text: &str) -> Result<()>;

    /// Show the typing/loading animation for `seconds`.
    async fn show_loading(&self, conversation_id: &ConversationId, seconds: u32) -> Result<()>;
}

/// Turns a raw webhook body into inbound messages after checking its signature.
pub trait WebhookDecoder: Send + Sync {
    fn verify_and_decode(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> std::result::Result<Vec<InboundMessage>, WebhookError>;
}
