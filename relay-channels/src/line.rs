use crate::traits::{MAX_REPLY_MESSAGES, Messenger};
use crate::types::{ConversationId, ReplyToken};
use anyhow::{Result, anyhow};
use serde::Serialize;
use std::time::Duration;

pub const LINE_API_BASE_URL: &str = "https://api.line.me";

const LOADING_SECONDS_STEP: u32 = 5;
const LOADING_SECONDS_MAX: u32 = 60;

#[derive(Clone)]
pub struct LineMessenger {
    http: reqwest::Client,
    access_token: String,
    base_url: String,
}

impl LineMessenger {
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_base_url(access_token, LINE_API_BASE_URL)
    }

    pub fn with_base_url(access_token: &str, base_url: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("line channel access token is required"));
        }
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("line api base url is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            base_url: base_url.to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, op: &str, path: &str, body: &T) -> Result<()> {
        let response = self
            .http
            .post(self.api_url(path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|error| format!("<failed to read line error body: {error}>"));
            return Err(anyhow!("line {op} failed: status={status} body={body}"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    r#type: &'static str,
    text: &'a str,
}

fn text_messages(texts: &[String]) -> Vec<TextMessage<'_>> {
    texts
        .iter()
        .map(|text| TextMessage {
            r#type: "text",
            text: text.as_str(),
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequest<'a> {
    reply_token: &'a str,
    messages: Vec<TextMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: Vec<TextMessage<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadingRequest<'a> {
    chat_id: &'a str,
    loading_seconds: u32,
}

/// Rounds up to the next multiple of 5 within 5..=60, which is all the
/// loading endpoint accepts.
pub fn normalize_loading_seconds(seconds: u32) -> u32 {
    let rounded = seconds.div_ceil(LOADING_SECONDS_STEP) * LOADING_SECONDS_STEP;
    rounded.clamp(LOADING_SECONDS_STEP, LOADING_SECONDS_MAX)
}

#[async_trait::async_trait]
impl Messenger for LineMessenger {
    #[tracing::instrument(level = "info", skip_all, fields(messages = texts.len()))]
    async fn reply(&self, reply_token: ReplyToken, texts: &[String]) -> Result<()> {
        if texts.is_empty() {
            return Err(anyhow!("reply requires at least one message"));
        }
        if texts.len() > MAX_REPLY_MESSAGES {
            return Err(anyhow!(
                "reply carries {} messages; at most {MAX_REPLY_MESSAGES} allowed",
                texts.len()
            ));
        }
        let body = ReplyRequest {
            reply_token: reply_token.as_str(),
            messages: text_messages(texts),
        };
        self.post_json("reply", "/v2/bot/message/reply", &body).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
    async fn push(&self, conversation_id: &ConversationId, text: &str) -> Result<()> {
        let to = conversation_id.trim();
        if to.is_empty() {
            return Err(anyhow!("push requires a conversation id"));
        }
        let body = PushRequest {
            to,
            messages: vec![TextMessage {
                r#type: "text",
                text,
            }],
        };
        self.post_json("push", "/v2/bot/message/push", &body).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %conversation_id))]
    async fn show_loading(&self, conversation_id: &ConversationId, seconds: u32) -> Result<()> {
        let body = LoadingRequest {
            chat_id: conversation_id.as_str(),
            loading_seconds: normalize_loading_seconds(seconds),
        };
        self.post_json("loading animation", "/v2/bot/chat/loading/start", &body)
            .await
    }
}
