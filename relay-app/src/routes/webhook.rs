use crate::server::AppState;
use axum::Extension;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use relay_channels::LINE_SIGNATURE_HEADER;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/webhook", post(receive_events))
        .route("/callback", post(receive_events))
}

/// Verifies the delivery and hands each message to its own task. The
/// platform gets its 200 before any answer is generated.
#[tracing::instrument(level = "info", skip_all, fields(body_bytes = body.len()))]
async fn receive_events(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get(LINE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let messages = match state.decoder.verify_and_decode(&body, signature) {
        Ok(messages) => messages,
        Err(error) => {
            tracing::warn!(%error, "webhook rejected");
            return (StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    tracing::info!(messages = messages.len(), "webhook accepted");
    for message in messages {
        state.orchestrator.dispatch(message);
    }
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use crate::delivery::tests::RecordingMessenger;
    use crate::generation::tests::ScriptedBackend;
    use crate::prompts::Prompts;
    use crate::server::tests::{TEST_SECRET, test_state};
    use axum::Extension;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use relay_channels::{LINE_SIGNATURE_HEADER, sign_body};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn text_event_body(text: &str) -> String {
        serde_json::json!({
            "destination": "Ubot",
            "events": [{
                "type": "message",
                "mode": "active",
                "timestamp": 1_700_000_000_000_u64,
                "webhookEventId": "01H",
                "replyToken": "reply-1",
                "source": {"type": "user", "userId": "U1"},
                "message": {"id": "m-1", "type": "text", "text": text}
            }]
        })
        .to_string()
    }

    fn post(uri: &str, body: String, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(LINE_SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body)).expect("request")
    }

    async fn body_text(response: axum::response::Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        String::from_utf8(body.to_vec()).expect("utf8 body")
    }

    async fn wait_for_replies(messenger: &RecordingMessenger, count: usize) {
        for _ in 0..200 {
            if messenger.replies().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} replies, got {:?}", messenger.sent());
    }

    #[tokio::test]
    async fn signed_message_is_acknowledged_and_answered() {
        let messenger = Arc::new(RecordingMessenger::default());
        let backend = Arc::new(ScriptedBackend::answering("WBS 是工作分解結構"));
        let state = test_state(5, messenger.clone(), backend.clone());
        let app = super::router().layer(Extension(state));

        let body = text_event_body("什麼是WBS");
        let signature = sign_body(TEST_SECRET, body.as_bytes());
        let response = app
            .oneshot(post("/callback", body, Some(signature)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");

        wait_for_replies(&messenger, 1).await;
        assert_eq!(
            messenger.replies(),
            vec![vec!["WBS 是工作分解結構".to_string()]]
        );
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn shortcut_query_through_webhook_gets_canned_reply() {
        let messenger = Arc::new(RecordingMessenger::default());
        let backend = Arc::new(ScriptedBackend::answering("unused"));
        let state = test_state(5, messenger.clone(), backend.clone());
        let app = super::router().layer(Extension(state));

        let body = text_event_body("查詢原因");
        let signature = sign_body(TEST_SECRET, body.as_bytes());
        let response = app
            .oneshot(post("/webhook", body, Some(signature)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        wait_for_replies(&messenger, 1).await;
        assert_eq!(
            messenger.replies(),
            vec![vec![Prompts::default().shortcut_reply]]
        );
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn bad_or_missing_signature_is_rejected() {
        let messenger = Arc::new(RecordingMessenger::default());
        let state = test_state(
            5,
            messenger.clone(),
            Arc::new(ScriptedBackend::answering("unused")),
        );
        let app = super::router().layer(Extension(state));

        let body = text_event_body("hello");
        let forged = sign_body("not-the-secret", body.as_bytes());
        let response = app
            .clone()
            .oneshot(post("/callback", body.clone(), Some(forged)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post("/callback", body, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let state = test_state(
            5,
            Arc::new(RecordingMessenger::default()),
            Arc::new(ScriptedBackend::answering("unused")),
        );
        let app = super::router().layer(Extension(state));

        let body = "{not json".to_string();
        let signature = sign_body(TEST_SECRET, body.as_bytes());
        let response = app
            .oneshot(post("/callback", body, Some(signature)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
