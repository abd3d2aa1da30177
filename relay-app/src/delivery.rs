//! Maps segments onto the reply / push primitives.

use crate::chunker::MessageSegment;
use relay_channels::{ConversationId, Messenger, ReplyToken};
use std::sync::Arc;
use std::time::Duration;

/// Which segments travel with the single reply and which follow as pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub reply: Vec<MessageSegment>,
    pub pushes: Vec<MessageSegment>,
}

impl DeliveryPlan {
    pub fn new(mut segments: Vec<MessageSegment>, max_reply_segments: usize) -> Self {
        let split_at = segments.len().min(max_reply_segments);
        let pushes = segments.split_off(split_at);
        Self {
            reply: segments,
            pushes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Segments carried by a successful reply call.
    pub replied: usize,
    pub reply_failed: bool,
    pub pushed: usize,
    pub push_failures: usize,
}

impl DeliveryReport {
    pub fn delivered_everything(&self, planned: usize) -> bool {
        !self.reply_failed && self.replied + self.pushed == planned
    }
}

#[derive(Clone)]
pub struct DeliveryPlanner {
    messenger: Arc<dyn Messenger>,
    max_reply_segments: usize,
    push_delay: Duration,
}

impl DeliveryPlanner {
    pub fn new(messenger: Arc<dyn Messenger>, max_reply_segments: usize, push_delay: Duration) -> Self {
        Self {
            messenger,
            max_reply_segments: max_reply_segments.max(1),
            push_delay,
        }
    }

    /// Sends the first segments through the reply token and the rest as
    /// pushes, in order.
    ///
    /// A failed reply abandons the whole delivery. A failed push is logged
    /// and the remaining pushes still go out.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id, segments = segments.len()))]
    pub async fn plan_and_send(
        &self,
        segments: Vec<MessageSegment>,
        reply_token: ReplyToken,
        conversation_id: &ConversationId,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if segments.is_empty() {
            tracing::warn!("nothing to deliver; reply token left unused");
            return report;
        }

        let plan = DeliveryPlan::new(segments, self.max_reply_segments);
        let reply_texts: Vec<String> = plan.reply.into_iter().map(|s| s.text).collect();
        match self.messenger.reply(reply_token, &reply_texts).await {
            Ok(()) => {
                report.replied = reply_texts.len();
                tracing::info!(messages = report.replied, "reply sent");
            }
            Err(error) => {
                report.reply_failed = true;
                tracing::error!(%error, "reply failed; abandoning delivery");
                return report;
            }
        }

        for (n, segment) in plan.pushes.iter().enumerate() {
            if n > 0 && !self.push_delay.is_zero() {
                tokio::time::sleep(self.push_delay).await;
            }
            match self.messenger.push(conversation_id, &segment.text).await {
                Ok(()) => {
                    report.pushed += 1;
                    tracing::info!(segment = segment.index, "follow-up push sent");
                }
                Err(error) => {
                    report.push_failures += 1;
                    tracing::error!(%error, segment = segment.index, "follow-up push failed");
                }
            }
        }
        report
    }
}
