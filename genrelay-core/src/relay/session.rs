use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

use crate::config::ServerCfg;
use crate::error::GenRelayError;
use crate::model::GenerateOptions;
use crate::provider::TextProvider;
use crate::stream::StreamEvent;
use crate::telemetry::{
    KEY_CHUNKS, KEY_ERROR_KIND, KEY_LATENCY_MS, KEY_MODEL, KEY_OUTCOME, KEY_PROVIDER,
    KEY_SESSION_ID, KEY_SUBJECT, SessionLog, SessionOutcome,
    emit_session,
};

/// Time bounds applied to every stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Keep-alive comment interval.
    pub heartbeat: Duration,
    /// Hard ceiling on one session, raced against every upstream read.
    pub max_duration: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(20),
            max_duration: Duration::from_secs(300),
        }
    }
}

impl StreamPolicy {
    pub fn from_cfg(cfg: &ServerCfg) -> Self {
        Self {
            heartbeat: Duration::from_secs(cfg.heartbeat_secs),
            max_duration: Duration::from_secs(cfg.max_stream_secs),
        }
    }
}

/// One accepted stream request.
///
/// The session is owned by the response body. When axum drops the body
/// (client disconnect), `Drop` cancels the token, which stops the upstream
/// read, and records the session as disconnected.
pub struct StreamSession {
    id: Uuid,
    cancel: CancellationToken,
    started: Instant,
    provider: String,
    model: Option<String>,
    subject: String,
    chunks: u64,
    outcome: Option<SessionOutcome>,
    span: Span,
}

impl StreamSession {
    pub fn open(
        shutdown: &CancellationToken,
        provider: &str,
        model: Option<&str>,
        subject: &str,
    ) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "relay.stream",
            session.id = tracing::field::Empty,
            llm.provider = tracing::field::Empty,
            llm.model = tracing::field::Empty,
            auth.subject = tracing::field::Empty,
            stream.outcome = tracing::field::Empty,
            stream.chunks = tracing::field::Empty,
            latency.ms = tracing::field::Empty,
            error.kind = tracing::field::Empty,
        );
        span.record(KEY_SESSION_ID, tracing::field::display(id));
        span.record(KEY_PROVIDER, provider);
        span.record(KEY_MODEL, model.unwrap_or("default"));
        span.record(KEY_SUBJECT, subject);
        Self {
            id,
            cancel: shutdown.child_token(),
            started: Instant::now(),
            provider: provider.to_string(),
            model: model.map(str::to_string),
            subject: subject.to_string(),
            chunks: 0,
            outcome: None,
            span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    fn record_chunk(&mut self) {
        self.chunks += 1;
    }

    /// Record the terminal outcome. Only the first call counts.
    fn finish(&mut self, outcome: SessionOutcome, error_kind: Option<&'static str>) {
        if self.outcome.is_some() {
            return;
        }
        self.outcome = Some(outcome);
        self.cancel.cancel();

        let latency_ms = self.started.elapsed().as_millis() as u64;
        self.span.record(KEY_OUTCOME, outcome.as_str());
        self.span.record(KEY_CHUNKS, self.chunks);
        self.span.record(KEY_LATENCY_MS, latency_ms);
        if let Some(kind) = error_kind {
            self.span.record(KEY_ERROR_KIND, kind);
        }
        self.span.in_scope(|| {
            tracing::debug!(outcome = %outcome, chunks = self.chunks, latency_ms, "stream session closed");
        });

        emit_session(
            SessionLog::new(self.id.to_string(), outcome)
                .provider(&self.provider)
                .model_opt(self.model.as_deref())
                .subject(&self.subject)
                .chunks(self.chunks)
                .latency_ms(latency_ms)
                .error_kind_opt(error_kind),
        );
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        // No outcome yet means nobody is reading any more.
        self.finish(SessionOutcome::Disconnected, None);
    }
}

enum Step<T> {
    Cancelled,
    Timeout,
    Next(T),
}

/// Drive one provider stream to exactly one terminal event.
///
/// Every upstream read is raced against the session token and the
/// max-duration deadline. Whatever happens, the output is zero or more
/// `Chunk`s followed by exactly one `Done` or `Error`.
pub fn session_events(
    provider: Arc<dyn TextProvider>,
    prompt: String,
    opts: GenerateOptions,
    mut session: StreamSession,
    policy: StreamPolicy,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        let cancel = session.token();
        let deadline = tokio::time::sleep(policy.max_duration);
        tokio::pin!(deadline);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            _ = &mut deadline => Step::Timeout,
            r = provider.generate_stream(&prompt, &opts, cancel.clone()) => Step::Next(r),
        };
        let mut fragments = match opened {
            Step::Next(Ok(s)) => Some(s),
            Step::Next(Err(e)) if e.is_cancellation() => None,
            Step::Next(Err(e)) => {
                tracing::warn!(error = %e, kind = e.kind(), "provider stream failed to open");
                session.finish(SessionOutcome::Error, Some(e.kind()));
                yield StreamEvent::Error(e.user_message());
                return;
            }
            Step::Timeout => {
                session.finish(SessionOutcome::Timeout, Some("stream_timeout"));
                tracing::info!(limit_secs = policy.max_duration.as_secs(), "stream timed out before first fragment");
                yield StreamEvent::Error(GenRelayError::StreamTimeout(policy.max_duration).user_message());
                return;
            }
            Step::Cancelled => None,
        };

        loop {
            let step = match fragments.as_mut() {
                None => Step::Cancelled,
                Some(upstream) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = &mut deadline => Step::Timeout,
                    next = upstream.next() => Step::Next(next),
                },
            };
            match step {
                Step::Next(Some(Ok(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    session.record_chunk();
                    yield StreamEvent::Chunk(text);
                }
                Step::Next(Some(Err(e))) if !e.is_cancellation() => {
                    drop(fragments.take());
                    tracing::warn!(error = %e, kind = e.kind(), "provider stream failed");
                    session.finish(SessionOutcome::Error, Some(e.kind()));
                    yield StreamEvent::Error(e.user_message());
                    return;
                }
                Step::Next(None) => {
                    session.finish(SessionOutcome::Done, None);
                    yield StreamEvent::Done;
                    return;
                }
                Step::Timeout => {
                    // cancel first so the provider stops reading, then release it
                    cancel.cancel();
                    drop(fragments.take());
                    tracing::info!(limit_secs = policy.max_duration.as_secs(), "stream timed out");
                    session.finish(SessionOutcome::Timeout, Some("stream_timeout"));
                    yield StreamEvent::Error(GenRelayError::StreamTimeout(policy.max_duration).user_message());
                    return;
                }
                Step::Cancelled | Step::Next(Some(Err(_))) => {
                    drop(fragments.take());
                    tracing::debug!("stream cancelled");
                    session.finish(SessionOutcome::Cancelled, Some("cancelled"));
                    yield StreamEvent::Error(GenRelayError::Cancelled.user_message());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_capture::{install_capture, memory_sink};
    use crate::test_util::{ScriptedProvider, Tail, connection_refused};

    fn open(shutdown: &CancellationToken) -> StreamSession {
        StreamSession::open(shutdown, "ollama", Some("llama3"), "alice")
    }

    async fn run(provider: Arc<ScriptedProvider>, session: StreamSession, policy: StreamPolicy) -> Vec<StreamEvent> {
        session_events(provider, "Say hi".into(), GenerateOptions::default(), session, policy)
            .collect()
            .await
    }

    fn assert_single_terminal(events: &[StreamEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "events: {events:?}");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn chunks_then_done() {
        let sink = memory_sink();
        let provider = Arc::new(ScriptedProvider::fragments("ollama", &["He", "", "llo"]));
        let session = open(&CancellationToken::new());
        let id = session.id().to_string();
        let events = run(provider, session, StreamPolicy::default()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("He".into()),
                StreamEvent::Chunk("llo".into()),
                StreamEvent::Done
            ]
        );
        let log = sink.find(&id).expect("session log");
        assert_eq!(log.outcome, SessionOutcome::Done);
        assert_eq!(log.chunks, 2);
        assert_eq!(log.subject.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn upstream_failure_after_chunks_is_one_sanitized_error() {
        let provider = Arc::new(ScriptedProvider::new("ollama", &["He"], Tail::Fail(connection_refused)));
        let events = run(provider, open(&CancellationToken::new()), StreamPolicy::default()).await;
        assert_single_terminal(&events);
        assert_eq!(events[0], StreamEvent::Chunk("He".into()));
        match &events[1] {
            StreamEvent::Error(msg) => {
                assert_eq!(msg, "generation provider is unavailable");
                assert!(!msg.contains("10.1.2.3"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_responding_provider_times_out() {
        let sink = memory_sink();
        let provider = Arc::new(ScriptedProvider::hanging("ollama"));
        let session = open(&CancellationToken::new());
        let id = session.id().to_string();
        let events = run(provider.clone(), session, StreamPolicy::default()).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error("stream timeout: generation exceeded 300s".into())]
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(provider.saw_cancel());
        assert_eq!(sink.find(&id).unwrap().outcome, SessionOutcome::Timeout);
    }

    #[tokio::test]
    async fn shutdown_cancels_live_stream_quietly() {
        let (logs, _guard) = install_capture();
        let shutdown = CancellationToken::new();
        let provider = Arc::new(ScriptedProvider::new("ollama", &["a"], Tail::Hang));
        let events = session_events(
            provider.clone(),
            "x".into(),
            GenerateOptions::default(),
            open(&shutdown),
            StreamPolicy::default(),
        );
        tokio::pin!(events);
        assert_eq!(events.next().await, Some(StreamEvent::Chunk("a".into())));
        shutdown.cancel();
        assert_eq!(
            events.next().await,
            Some(StreamEvent::Error("stream cancelled".into()))
        );
        assert_eq!(events.next().await, None);
        assert!(logs.faults().is_empty(), "cancellation must not log faults");
        assert_eq!(logs.span_values(KEY_OUTCOME), vec!["cancelled".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_before_first_fragment_emits_nothing_but_terminal() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let provider = Arc::new(ScriptedProvider::fragments("ollama", &["never"]));
        let events = run(provider.clone(), open(&shutdown), StreamPolicy::default()).await;
        assert_eq!(events, vec![StreamEvent::Error("stream cancelled".into())]);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn dropped_session_counts_as_disconnect() {
        let sink = memory_sink();
        let (logs, _guard) = install_capture();
        let session = open(&CancellationToken::new());
        let id = session.id().to_string();
        let token = session.token();
        drop(session);
        assert!(token.is_cancelled());
        assert_eq!(sink.find(&id).unwrap().outcome, SessionOutcome::Disconnected);
        assert!(logs.faults().is_empty());
    }

    #[test]
    fn session_span_carries_identity_fields() {
        let (logs, _guard) = install_capture();
        let session = open(&CancellationToken::new());
        let id = session.id().to_string();
        assert_eq!(logs.span_values(KEY_SESSION_ID), vec![id]);
        assert_eq!(logs.span_values(KEY_PROVIDER), vec!["ollama".to_string()]);
        assert_eq!(logs.span_values(KEY_MODEL), vec!["llama3".to_string()]);
        assert_eq!(logs.span_values(KEY_SUBJECT), vec!["alice".to_string()]);
    }
}
