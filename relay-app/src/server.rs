//! Relay server.
//!
//! Wires the LINE messenger, the completion client and the message pipeline
//! together and mounts the webhook routes.

use crate::admission::AdmissionGate;
use crate::config::RelayConfig;
use crate::delivery::DeliveryPlanner;
use crate::generation::GenerationClient;
use crate::orchestrator::Orchestrator;
use crate::prompts::Prompts;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use relay_channels::{
    LineMessenger, LineWebhookDecoder, MAX_REPLY_MESSAGES, Messenger, WebhookDecoder,
};
use relay_llm::LlmClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub decoder: Arc<dyn WebhookDecoder>,
    pub gate: Arc<AdmissionGate>,
}

pub async fn doctor() -> Result<()> {
    let cfg = RelayConfig::load()?;
    let prompts = Prompts::load(cfg.prompts_file.as_deref()).await?;
    let llm = build_llm_client(&cfg)?;
    LineMessenger::with_base_url(&cfg.line.access_token, &cfg.line.api_base_url)?;
    tracing::info!(
        config = %cfg.redacted_summary(),
        model = llm.model(),
        shortcut_queries = prompts.shortcut_queries.len(),
        "config ok"
    );
    Ok(())
}

pub async fn serve() -> Result<()> {
    let cfg = RelayConfig::load()?;
    tracing::info!(config = %cfg.redacted_summary(), "configuration loaded");

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = preflight_bind_listener(addr).await?;

    let prompts = Arc::new(Prompts::load(cfg.prompts_file.as_deref()).await?);
    let messenger: Arc<dyn Messenger> = Arc::new(LineMessenger::with_base_url(
        &cfg.line.access_token,
        &cfg.line.api_base_url,
    )?);
    let decoder: Arc<dyn WebhookDecoder> =
        Arc::new(LineWebhookDecoder::new(&cfg.line.channel_secret));
    let llm = Arc::new(build_llm_client(&cfg)?);

    let state = build_state(&cfg, prompts, messenger, decoder, llm);
    let orchestrator = Arc::clone(&state.orchestrator);
    let app = app(state, &cfg);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    tracing::info!(%addr, "pmp-relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;
    tracing::info!("http server shutdown completed");

    // Accepted webhooks were already acknowledged; finish answering them.
    orchestrator.drain(cfg.server.shutdown_drain).await;
    Ok(())
}

pub(crate) fn build_state(
    cfg: &RelayConfig,
    prompts: Arc<Prompts>,
    messenger: Arc<dyn Messenger>,
    decoder: Arc<dyn WebhookDecoder>,
    backend: Arc<dyn crate::generation::CompletionBackend>,
) -> Arc<AppState> {
    let gate = Arc::new(AdmissionGate::new(cfg.pipeline.max_concurrent_requests));
    let generator = GenerationClient::new(backend, prompts.clone(), cfg.generation.soft_timeout);
    let planner = DeliveryPlanner::new(
        messenger.clone(),
        MAX_REPLY_MESSAGES,
        cfg.pipeline.push_delay,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        gate.clone(),
        generator,
        planner,
        messenger,
        prompts,
        cfg.pipeline.max_segment_chars,
        cfg.pipeline.loading_seconds,
    ));
    Arc::new(AppState {
        orchestrator,
        decoder,
        gate,
    })
}

pub(crate) fn app(state: Arc<AppState>, cfg: &RelayConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            cfg.server.http_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn build_llm_client(cfg: &RelayConfig) -> Result<LlmClient> {
    let generation = &cfg.generation;
    LlmClient::new(
        &generation.base_url,
        &generation.api_key,
        &generation.model,
        generation.sampling,
    )
    .map_err(|e| anyhow::anyhow!("build completion client: {e}"))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
