//! Generation client: one upstream call per admitted message, measured
//! against a soft timeout.

use crate::prompts::Prompts;
use async_trait::async_trait;
use relay_llm::LlmClient;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seam between the pipeline and the completion endpoint.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn generate_text(&self, system_prompt: &str, user_text: &str) -> relay_llm::Result<String>;
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn generate_text(&self, system_prompt: &str, user_text: &str) -> relay_llm::Result<String> {
        let completion = self.complete(system_prompt, user_text).await?;
        tracing::debug!(
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            finish_reason = %completion.finish_reason,
            "completion received"
        );
        Ok(completion.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub text: String,
    pub ok: bool,
}

impl GenerationResult {
    fn answer(text: String) -> Self {
        Self { text, ok: true }
    }

    fn fallback(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ok: false,
        }
    }
}

#[derive(Clone)]
pub struct GenerationClient {
    backend: Arc<dyn CompletionBackend>,
    prompts: Arc<Prompts>,
    soft_timeout: Duration,
}

impl GenerationClient {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        prompts: Arc<Prompts>,
        soft_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            prompts,
            soft_timeout,
        }
    }

    /// Runs the upstream call on its own task and waits for it.
    ///
    /// Passing `soft_timeout` only logs; the call is never cancelled and a
    /// late answer is still returned. Upstream failures come back as a
    /// fallback text with `ok == false`, never as an error.
    #[tracing::instrument(level = "info", skip_all, fields(user_chars = user_text.chars().count()))]
    pub async fn generate(&self, user_text: &str) -> GenerationResult {
        let started = Instant::now();
        let backend = Arc::clone(&self.backend);
        let prompts = Arc::clone(&self.prompts);
        let user_text = user_text.to_string();
        let mut call = tokio::spawn(async move {
            match backend.generate_text(&prompts.system_prompt, &user_text).await {
                Ok(text) => GenerationResult::answer(text),
                Err(error) if error.is_status() => {
                    tracing::error!(%error, "generation endpoint returned an error status");
                    GenerationResult::fallback(&prompts.upstream_error_reply)
                }
                Err(error) => {
                    tracing::error!(%error, "generation request failed");
                    GenerationResult::fallback(&prompts.upstream_exception_reply)
                }
            }
        });

        let joined = match tokio::time::timeout(self.soft_timeout, &mut call).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(
                    soft_timeout_ms = self.soft_timeout.as_millis() as u64,
                    "generation exceeded soft timeout; still waiting for the answer"
                );
                call.await
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(%error, "generation task failed");
                GenerationResult::fallback(&self.prompts.task_failure_reply)
            }
        };
        tracing::info!(
            ok = result.ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            answer_chars = result.text.chars().count(),
            "generation finished"
        );
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use relay_llm::LlmError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend that records every call.
    pub(crate) struct ScriptedBackend {
        reply: Box<dyn Fn() -> relay_llm::Result<String> + Send + Sync>,
        delay: Duration,
        pub(crate) calls: AtomicUsize,
        pub(crate) last_request: Mutex<Option<(String, String)>>,
    }

    impl ScriptedBackend {
        pub(crate) fn answering(text: &str) -> Self {
            let text = text.to_string();
            Self::with(move || Ok(text.clone()))
        }

        pub(crate) fn with<F>(reply: F) -> Self
        where
            F: Fn() -> relay_llm::Result<String> + Send + Sync + 'static,
        {
            Self {
                reply: Box::new(reply),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        pub(crate) fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn generate_text(
            &self,
            system_prompt: &str,
            user_text: &str,
        ) -> relay_llm::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().expect("lock") =
                Some((system_prompt.to_string(), user_text.to_string()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.reply)()
        }
    }

    fn client(backend: Arc<ScriptedBackend>, soft_timeout: Duration) -> GenerationClient {
        GenerationClient::new(backend, Arc::new(Prompts::default()), soft_timeout)
    }

    #[tokio::test]
    async fn success_returns_generated_text() {
        let backend = Arc::new(ScriptedBackend::answering("WBS 是工作分解結構"));
        let result = client(backend.clone(), Duration::from_secs(5))
            .generate("什麼是WBS")
            .await;
        assert_eq!(
            result,
            GenerationResult {
                text: "WBS 是工作分解結構".to_string(),
                ok: true
            }
        );
        let (system, user) = backend
            .last_request
            .lock()
            .expect("lock")
            .clone()
            .expect("request recorded");
        assert_eq!(system, Prompts::default().system_prompt);
        assert_eq!(user, "什麼是WBS");
    }

    #[tokio::test]
    async fn error_status_maps_to_error_fallback() {
        let backend = Arc::new(ScriptedBackend::with(|| {
            Err(LlmError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        }));
        let result = client(backend, Duration::from_secs(5)).generate("hi").await;
        assert!(!result.ok);
        assert_eq!(result.text, Prompts::default().upstream_error_reply);
    }

    #[tokio::test]
    async fn transport_failure_maps_to_exception_fallback() {
        let backend = Arc::new(ScriptedBackend::with(|| {
            Err(LlmError::Http("connection reset".to_string()))
        }));
        let result = client(backend, Duration::from_secs(5)).generate("hi").await;
        assert!(!result.ok);
        assert_eq!(result.text, Prompts::default().upstream_exception_reply);
    }

    #[tokio::test]
    async fn late_answer_is_kept_after_soft_timeout() {
        let backend = Arc::new(
            ScriptedBackend::answering("slow but complete").delayed(Duration::from_millis(150)),
        );
        let started = Instant::now();
        let result = client(backend.clone(), Duration::from_millis(20))
            .generate("hi")
            .await;
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(result.ok);
        assert_eq!(result.text, "slow but complete");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn panicking_backend_maps_to_task_failure_fallback() {
        let backend = Arc::new(ScriptedBackend::with(|| panic!("backend bug")));
        let result = client(backend, Duration::from_secs(5)).generate("hi").await;
        assert!(!result.ok);
        assert_eq!(result.text, Prompts::default().task_failure_reply);
    }

    #[tokio::test]
    async fn identical_input_and_upstream_give_identical_results() {
        let backend = Arc::new(ScriptedBackend::answering("same"));
        let client = client(backend, Duration::from_secs(5));
        let first = client.generate("question").await;
        let second = client.generate("question").await;
        assert_eq!(first, second);
    }
}
