//! Per-message pipeline: shortcut → admit → generate → augment → deliver.

use crate::admission::AdmissionGate;
use crate::chunker;
use crate::delivery::{DeliveryPlanner, DeliveryReport};
use crate::generation::GenerationClient;
use crate::prompts::Prompts;
use relay_channels::{InboundMessage, Messenger};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

/// How handling of one message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Answered with the canned "why no response" explanation.
    Canned,
    /// Turned away at the admission gate.
    Busy,
    /// Generated answer delivered (possibly partially).
    Generated(DeliveryReport),
    /// Generation failed; the fallback text was delivered instead.
    Fallback(DeliveryReport),
}

pub struct Orchestrator {
    gate: Arc<AdmissionGate>,
    generator: GenerationClient,
    planner: DeliveryPlanner,
    messenger: Arc<dyn Messenger>,
    prompts: Arc<Prompts>,
    max_segment_chars: usize,
    loading_seconds: u32,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        gate: Arc<AdmissionGate>,
        generator: GenerationClient,
        planner: DeliveryPlanner,
        messenger: Arc<dyn Messenger>,
        prompts: Arc<Prompts>,
        max_segment_chars: usize,
        loading_seconds: u32,
    ) -> Self {
        Self {
            gate,
            generator,
            planner,
            messenger,
            prompts,
            max_segment_chars,
            loading_seconds,
            tasks: TaskTracker::new(),
        }
    }

    /// Handles the message on its own task so a failure there stays there.
    /// The task is tracked so [`Orchestrator::drain`] can wait for it.
    pub fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let outcome = this.handle(message).await;
            tracing::debug!(?outcome, "message handled");
        });
    }

    /// Waits up to `timeout` for every dispatched message to finish.
    /// Returns `false` when some were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let pending = self.tasks.len();
        if pending == 0 {
            return true;
        }
        tracing::info!(
            pending,
            timeout_ms = timeout.as_millis() as u64,
            "draining dispatched messages"
        );
        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => {
                tracing::info!("dispatched messages drained");
                true
            }
            Err(_) => {
                tracing::warn!(
                    pending = self.tasks.len(),
                    "drain timeout reached; abandoning unfinished messages"
                );
                false
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            message_id = %message.message_id,
            conversation_id = %message.conversation_id,
            sender_id = %message.sender_id,
            received_at = %message.received_at,
        )
    )]
    pub async fn handle(&self, message: InboundMessage) -> Outcome {
        let InboundMessage {
            conversation_id,
            text,
            reply_token,
            ..
        } = message;
        let user_text = text.trim();
        tracing::info!(chars = user_text.chars().count(), "message received");

        if self.prompts.is_shortcut(user_text) {
            self.reply_single(reply_token, &self.prompts.shortcut_reply, "shortcut")
                .await;
            return Outcome::Canned;
        }

        let Some(_ticket) = self.gate.try_acquire() else {
            tracing::info!(
                ceiling = self.gate.ceiling(),
                "system busy: concurrent request ceiling reached"
            );
            self.reply_single(reply_token, &self.prompts.busy_reply, "busy")
                .await;
            return Outcome::Busy;
        };
        tracing::debug!(in_flight = self.gate.in_flight(), "admitted");

        if let Err(error) = self
            .messenger
            .show_loading(&conversation_id, self.loading_seconds)
            .await
        {
            tracing::warn!(%error, "loading animation failed; continuing");
        }

        let generation = self.generator.generate(user_text).await;
        let answer = self.prompts.augment(user_text, generation.text);
        let segments = chunker::split(&answer, self.max_segment_chars);
        let planned = segments.len();
        let report = self
            .planner
            .plan_and_send(segments, reply_token, &conversation_id)
            .await;
        tracing::info!(
            generated = generation.ok,
            planned,
            delivered_all = report.delivered_everything(planned),
            "delivery finished"
        );

        if generation.ok {
            Outcome::Generated(report)
        } else {
            Outcome::Fallback(report)
        }
    }

    async fn reply_single(&self, reply_token: relay_channels::ReplyToken, text: &str, kind: &str) {
        if let Err(error) = self.messenger.reply(reply_token, &[text.to_string()]).await {
            tracing::error!(%error, kind, "canned reply failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::delivery::tests::{RecordingMessenger, Sent};
    use crate::generation::tests::ScriptedBackend;
    use chrono::Utc;
    use relay_channels::{MAX_REPLY_MESSAGES, ReplyToken};
    use relay_llm::LlmError;

    pub(crate) struct Harness {
        pub(crate) orchestrator: Arc<Orchestrator>,
        pub(crate) gate: Arc<AdmissionGate>,
        pub(crate) messenger: Arc<RecordingMessenger>,
        pub(crate) backend: Arc<ScriptedBackend>,
    }

    pub(crate) fn harness_with(
        messenger: RecordingMessenger,
        backend: ScriptedBackend,
        ceiling: usize,
        max_segment_chars: usize,
    ) -> Harness {
        let prompts = Arc::new(Prompts::default());
        let gate = Arc::new(AdmissionGate::new(ceiling));
        let messenger = Arc::new(messenger);
        let backend = Arc::new(backend);
        let generator = GenerationClient::new(
            backend.clone(),
            prompts.clone(),
            Duration::from_secs(5),
        );
        let planner = DeliveryPlanner::new(messenger.clone(), MAX_REPLY_MESSAGES, Duration::ZERO);
        let orchestrator = Arc::new(Orchestrator::new(
            gate.clone(),
            generator,
            planner,
            messenger.clone(),
            prompts,
            max_segment_chars,
            10,
        ));
        Harness {
            orchestrator,
            gate,
            messenger,
            backend,
        }
    }

    pub(crate) fn harness(answer: &str) -> Harness {
        harness_with(
            RecordingMessenger::default(),
            ScriptedBackend::answering(answer),
            5,
            1000,
        )
    }

    pub(crate) fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            message_id: "m-1".into(),
            conversation_id: "U1".into(),
            sender_id: "U1".into(),
            text: text.to_string(),
            reply_token: ReplyToken::new("reply-1"),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn shortcut_query_gets_canned_reply_without_generation() {
        let h = harness("unused");
        let outcome = h.orchestrator.handle(inbound("查詢原因")).await;

        assert_eq!(outcome, Outcome::Canned);
        assert_eq!(h.backend.call_count(), 0);
        assert_eq!(h.gate.in_flight(), 0);
        assert_eq!(
            h.messenger.sent(),
            vec![Sent::Reply {
                token: "reply-1".to_string(),
                texts: vec![Prompts::default().shortcut_reply],
            }]
        );
    }

    #[tokio::test]
    async fn saturated_gate_answers_busy_without_generation() {
        let h = harness("unused");
        let held: Vec<_> = (0..5)
            .map(|_| h.gate.try_acquire().expect("ticket"))
            .collect();

        let outcome = h.orchestrator.handle(inbound("什麼是風險登錄冊？")).await;

        assert_eq!(outcome, Outcome::Busy);
        assert_eq!(h.backend.call_count(), 0);
        assert_eq!(
            h.messenger.replies(),
            vec![vec![Prompts::default().busy_reply]]
        );
        assert_eq!(h.gate.in_flight(), 5);
        drop(held);
        assert_eq!(h.gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn sixth_concurrent_message_is_turned_away() {
        let h = harness_with(
            RecordingMessenger::default(),
            ScriptedBackend::answering("ok").delayed(Duration::from_millis(200)),
            5,
            1000,
        );

        let mut in_flight = Vec::new();
        for _ in 0..5 {
            let orchestrator = Arc::clone(&h.orchestrator);
            in_flight.push(tokio::spawn(async move {
                orchestrator.handle(inbound("問題")).await
            }));
        }
        // Let the five reach the upstream call and hold their tickets.
        while h.backend.call_count() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.gate.in_flight(), 5);

        let sixth = h.orchestrator.handle(inbound("問題")).await;
        assert_eq!(sixth, Outcome::Busy);
        assert_eq!(h.backend.call_count(), 5);

        let outcomes = futures_util::future::join_all(in_flight).await;
        for outcome in outcomes {
            assert!(matches!(outcome.expect("join"), Outcome::Generated(_)));
        }
        assert_eq!(h.gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn definition_question_gets_supplement_appended() {
        let h = harness("關鍵路徑是最長的路徑。");
        let outcome = h.orchestrator.handle(inbound("  關鍵路徑的定義？ ")).await;

        assert!(matches!(outcome, Outcome::Generated(_)));
        let expected = format!(
            "關鍵路徑是最長的路徑。\n\n{}",
            Prompts::default().supplement_block
        );
        assert_eq!(h.messenger.replies(), vec![vec![expected]]);
        let (_, user) = h
            .backend
            .last_request
            .lock()
            .expect("lock")
            .clone()
            .expect("request");
        assert_eq!(user, "關鍵路徑的定義？");
    }

    #[tokio::test]
    async fn long_augmented_answer_is_chunked() {
        let answer = "專案章程授權專案經理。".repeat(20);
        let h = harness_with(
            RecordingMessenger::default(),
            ScriptedBackend::answering(&answer),
            5,
            100,
        );
        let outcome = h.orchestrator.handle(inbound("專案章程的定義")).await;

        let Outcome::Generated(report) = outcome else {
            panic!("expected generated outcome, got {outcome:?}");
        };
        let full = format!("{answer}\n\n{}", Prompts::default().supplement_block);
        let expected: Vec<String> = chunker::split(&full, 100)
            .into_iter()
            .map(|s| s.text)
            .collect();
        assert!(expected.len() > 1);

        let mut delivered: Vec<String> = h.messenger.replies().concat();
        delivered.extend(h.messenger.pushes());
        assert_eq!(delivered, expected);
        assert!(report.delivered_everything(expected.len()));
    }

    #[tokio::test]
    async fn loading_indicator_precedes_reply_and_its_failure_is_ignored() {
        let h = harness_with(
            RecordingMessenger {
                fail_loading: true,
                ..Default::default()
            },
            ScriptedBackend::answering("答案"),
            5,
            1000,
        );
        let outcome = h.orchestrator.handle(inbound("問題")).await;

        assert!(matches!(outcome, Outcome::Generated(_)));
        let sent = h.messenger.sent();
        assert_eq!(
            sent[0],
            Sent::Loading {
                to: "U1".to_string(),
                seconds: 10
            }
        );
        assert_eq!(h.messenger.replies(), vec![vec!["答案".to_string()]]);
    }

    #[tokio::test]
    async fn generation_failure_delivers_fallback_and_releases_ticket() {
        let h = harness_with(
            RecordingMessenger::default(),
            ScriptedBackend::with(|| Err(LlmError::Http("timed out".to_string()))),
            1,
            1000,
        );
        let outcome = h.orchestrator.handle(inbound("問題")).await;

        assert!(matches!(outcome, Outcome::Fallback(_)));
        assert_eq!(
            h.messenger.replies(),
            vec![vec![Prompts::default().upstream_exception_reply]]
        );
        assert_eq!(h.gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_reply_still_releases_ticket() {
        let h = harness_with(
            RecordingMessenger {
                fail_reply: true,
                ..Default::default()
            },
            ScriptedBackend::answering("答案"),
            1,
            1000,
        );
        let outcome = h.orchestrator.handle(inbound("問題")).await;

        let Outcome::Generated(report) = outcome else {
            panic!("expected generated outcome, got {outcome:?}");
        };
        assert!(report.reply_failed);
        assert_eq!(h.gate.in_flight(), 0);
        assert!(h.gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn drain_waits_for_dispatched_message_to_be_answered() {
        let h = harness_with(
            RecordingMessenger::default(),
            ScriptedBackend::answering("遲到的答案").delayed(Duration::from_millis(200)),
            5,
            1000,
        );
        h.orchestrator.dispatch(inbound("問題"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.messenger.replies().is_empty());

        assert!(h.orchestrator.drain(Duration::from_secs(5)).await);
        assert_eq!(h.messenger.replies(), vec![vec!["遲到的答案".to_string()]]);
        assert_eq!(h.gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_gives_up_at_its_deadline() {
        let h = harness_with(
            RecordingMessenger::default(),
            ScriptedBackend::answering("slow").delayed(Duration::from_millis(500)),
            5,
            1000,
        );
        h.orchestrator.dispatch(inbound("問題"));

        assert!(!h.orchestrator.drain(Duration::from_millis(20)).await);
        assert!(h.messenger.replies().is_empty());
    }

    #[tokio::test]
    async fn drain_with_nothing_dispatched_returns_at_once() {
        let h = harness("unused");
        assert!(h.orchestrator.drain(Duration::ZERO).await);
    }
}
