use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::json;
use tracing::Span;
use tracing_futures::Instrument;

use super::AppState;
use super::session::{StreamSession, session_events};
use crate::auth::{Principal, bearer_token};
use crate::error::{CoreResult, GenRelayError};
use crate::model::{GenerateResponse, GenerationRequest, ProviderKind};
use crate::telemetry::keys::{KEY_PROVIDER, KEY_SUBJECT};
use crate::validate::{extract_json, validate_request};

pub const SESSION_HEADER: &str = "x-session-id";

async fn authenticate(state: &AppState, headers: &HeaderMap) -> CoreResult<Principal> {
    let token = bearer_token(headers)?;
    state.verifier.verify(token).await
}

fn parse_body(body: Result<Json<GenerationRequest>, JsonRejection>) -> CoreResult<GenerationRequest> {
    body.map(|Json(req)| req)
        .map_err(|e| GenRelayError::Validation(e.body_text()))
}

/// `POST /generate`: buffered generation.
pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, GenRelayError> {
    let principal = authenticate(&state, &headers).await?;
    let req = validate_request(parse_body(body)?, &state.limits)?;
    let provider = state.router.select(
        &state.registry,
        req.provider,
        req.options.model.as_deref(),
    )?;
    let span = Span::current();
    span.record(KEY_SUBJECT, principal.subject.as_str());
    span.record(KEY_PROVIDER, provider.name());

    // dropped with the handler future if the client goes away
    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let limit = state.policy.max_duration;
    let call = provider.generate(&req.prompt, &req.options, &cancel);
    let text = match tokio::time::timeout(limit, call).await {
        Ok(res) => res,
        Err(_) => {
            cancel.cancel();
            Err(GenRelayError::StreamTimeout(limit))
        }
    };
    let text = text?;

    let content = if req.options.json_mode {
        extract_json(provider.name(), &text)?
    } else {
        text
    };
    Ok(Json(GenerateResponse { content }))
}

/// `POST /stream`: incremental generation over `text/event-stream`.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, GenRelayError> {
    let principal = authenticate(&state, &headers).await?;
    let req = validate_request(parse_body(body)?, &state.limits)?;
    let provider = state.router.select(
        &state.registry,
        req.provider,
        req.options.model.as_deref(),
    )?;

    let request_span = Span::current();
    request_span.record(KEY_SUBJECT, principal.subject.as_str());
    request_span.record(KEY_PROVIDER, provider.name());

    let session = StreamSession::open(
        &state.shutdown,
        provider.name(),
        req.options.model.as_deref(),
        &principal.subject,
    );
    let session_id = session.id();
    let span = session.span();
    span.in_scope(|| tracing::debug!("stream session opened"));

    let events = session_events(provider, req.prompt, req.options, session, state.policy)
        .map(|ev| Ok::<_, std::convert::Infallible>(Event::default().data(ev.to_frame().to_json())))
        .instrument(span);

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.policy.heartbeat)
            .text("keep-alive"),
    );
    let mut resp = sse.into_response();
    if let Ok(v) = HeaderValue::from_str(&session_id.to_string()) {
        resp.headers_mut().insert(SESSION_HEADER, v);
    }
    Ok(resp)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let providers: Vec<&str> = ProviderKind::ALL
        .iter()
        .filter(|k| state.registry.is_configured(**k))
        .map(|k| k.as_str())
        .collect();
    Json(json!({
        "status": "ok",
        "default": state.registry.default_kind().as_str(),
        "providers": providers,
    }))
}
