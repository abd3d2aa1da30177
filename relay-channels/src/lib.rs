//! LINE channel adapter for the relay bot.
//!
//! Adapters are pure I/O: they turn signed webhook bodies into
//! `InboundMessage`s and carry reply / push / loading requests back to the
//! Messaging API.

mod line;
mod traits;
mod types;
mod webhook;

pub use line::{LINE_API_BASE_URL, LineMessenger, normalize_loading_seconds};
pub use traits::{MAX_REPLY_MESSAGES, Messenger, WebhookDecoder};
pub use types::{ConversationId, InboundMessage, MessageId, ReplyToken, SenderId};
pub use webhook::{LINE_SIGNATURE_HEADER, LineWebhookDecoder, WebhookError, sign_body};
