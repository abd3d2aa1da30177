//! Chat-completion client for the relay bot.
//!
//! Pure HTTP client against OpenAI-compatible `/chat/completions` endpoints
//! (x.ai by default). No knowledge of the messaging side.

mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_BASE_URL, DEFAULT_MODEL, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Completion, Role, SamplingParams, Usage};
