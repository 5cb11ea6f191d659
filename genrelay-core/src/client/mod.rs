//! Client side of the relay: authenticated calls with one-shot credential
//! refresh, bounded retry, and event-stream reassembly.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, GenRelayError};
use crate::framer::{DEFAULT_MAX_LINE_BYTES, FramedLines, LineFormat, LineFramer};
use crate::http_client::{HttpClient, truncate};
use crate::model::{ErrorBody, GenerateResponse, GenerationRequest};
use crate::stream::{StreamEvent, StreamFrame};

pub use retry::RetryPolicy;

/// Supplies the bearer credential for relay calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> CoreResult<SecretString>;
    /// Obtain a fresh credential after the relay rejected the current one.
    async fn refresh(&self) -> CoreResult<SecretString>;
}

/// A fixed token. Refreshing returns the same value.
pub struct StaticTokenSource {
    token: SecretString,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> CoreResult<SecretString> {
        Ok(self.token.clone())
    }
    async fn refresh(&self) -> CoreResult<SecretString> {
        Ok(self.token.clone())
    }
}

/// Notified when a refreshed credential is rejected too.
pub trait SignInHandler: Send + Sync {
    fn sign_in_required(&self);
}

#[derive(Clone)]
pub struct ClientOptions {
    /// False when the runtime cannot read a response body incrementally;
    /// `stream` then falls back to one buffered call.
    pub incremental: bool,
    pub retry: RetryPolicy,
    pub sign_in: Option<Arc<dyn SignInHandler>>,
    /// Longest SSE line accepted from the relay.
    pub max_line_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            incremental: true,
            retry: RetryPolicy::default(),
            sign_in: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Generate,
    Stream,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Generate => "/generate",
            Self::Stream => "/stream",
        }
    }

    fn retries(self) -> bool {
        matches!(self, Self::Generate)
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub cancel: Option<CancellationToken>,
    pub timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            cancel: None,
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct RelayClient {
    http: HttpClient,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    opts: ClientOptions,
}

impl RelayClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        opts: ClientOptions,
    ) -> CoreResult<Self> {
        Ok(Self::with_http(HttpClient::new_default()?, base_url, tokens, opts))
    }

    pub fn with_http(
        http: HttpClient,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        opts: ClientOptions,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            opts,
        }
    }

    /// Buffered generation through `POST /generate`.
    pub async fn generate(&self, req: &GenerationRequest) -> CoreResult<String> {
        self.generate_inner(req, None).await
    }

    async fn generate_inner(
        &self,
        req: &GenerationRequest,
        cancel: Option<&CancellationToken>,
    ) -> CoreResult<String> {
        let resp = self.execute(Endpoint::Generate, req, cancel).await?;
        let status = resp.status();
        let body: GenerateResponse = resp.json().await.map_err(|e| GenRelayError::ProviderProtocol {
            provider: "relay".into(),
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })?;
        Ok(body.content)
    }

    /// Incremental generation through `POST /stream`.
    ///
    /// `on_fragment` sees each chunk as it arrives; the accumulated text is
    /// returned once the relay sends `done`. Only the one-time credential
    /// refresh applies here; transient failures are not retried.
    pub async fn stream<F>(
        &self,
        req: &GenerationRequest,
        mut on_fragment: F,
        opts: StreamOptions,
    ) -> CoreResult<String>
    where
        F: FnMut(&str) + Send,
    {
        let cancel = opts.cancel.unwrap_or_default();
        let deadline = tokio::time::sleep(opts.timeout);
        tokio::pin!(deadline);

        if !self.opts.incremental {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GenRelayError::Cancelled),
                _ = &mut deadline => return Err(GenRelayError::StreamTimeout(opts.timeout)),
                r = self.generate_inner(req, Some(&cancel)) => r?,
            };
            on_fragment(&text);
            return Ok(text);
        }

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenRelayError::Cancelled),
            _ = &mut deadline => return Err(GenRelayError::StreamTimeout(opts.timeout)),
            r = self.execute(Endpoint::Stream, req, Some(&cancel)) => r?,
        };

        let mut lines = FramedLines::new(
            Box::pin(resp.bytes_stream()),
            LineFramer::with_max_len(self.opts.max_line_bytes),
            |e: reqwest::Error| GenRelayError::Network(format!("stream interrupted: {e}")),
        );
        let mut text = String::new();
        loop {
            // returning drops `lines`, which releases the connection
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GenRelayError::Cancelled),
                _ = &mut deadline => return Err(GenRelayError::StreamTimeout(opts.timeout)),
                n = lines.next() => n,
            };
            let line = match next {
                Some(line) => line?,
                None => {
                    return Err(GenRelayError::ProviderProtocol {
                        provider: "relay".into(),
                        code: "eof".into(),
                        message: "stream ended without a terminal frame".into(),
                    });
                }
            };
            let Some(payload) = LineFormat::EventStream.payload(&line) else {
                continue;
            };
            let frame: StreamFrame = match serde_json::from_str(payload) {
                Ok(f) => f,
                Err(e) => {
                    let err = GenRelayError::FrameParse(e.to_string());
                    tracing::warn!(error = %err, "skipping malformed relay frame");
                    continue;
                }
            };
            for event in frame.into_events() {
                match event {
                    StreamEvent::Chunk(s) => {
                        on_fragment(&s);
                        text.push_str(&s);
                    }
                    StreamEvent::Done => return Ok(text),
                    StreamEvent::Error(msg) => return Err(GenRelayError::Stream(msg)),
                }
            }
        }
    }

    /// Send with auth, retrying transient failures of buffered calls only.
    /// A 401 triggers one refresh and one resend, which does not count as a
    /// retry.
    async fn execute(
        &self,
        endpoint: Endpoint,
        req: &GenerationRequest,
        cancel: Option<&CancellationToken>,
    ) -> CoreResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let mut token = self.tokens.token().await?;
        let mut refreshed = false;
        let mut retries = 0u32;
        loop {
            let err = match self.send_once(&url, req, &token).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            match err {
                GenRelayError::Status { status: 401, .. } if !refreshed => {
                    tracing::debug!(url = %url, "credential rejected, refreshing once");
                    refreshed = true;
                    token = self.tokens.refresh().await?;
                }
                GenRelayError::Status { status: 401, message } => {
                    if let Some(h) = &self.opts.sign_in {
                        h.sign_in_required();
                    }
                    return Err(GenRelayError::Authentication(message));
                }
                e if endpoint.retries() && self.opts.retry.should_retry(&e, retries) => {
                    let delay = self.opts.retry.delay_for(retries);
                    retries += 1;
                    tracing::info!(
                        error = %e,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient relay failure, backing off"
                    );
                    match cancel {
                        Some(c) => tokio::select! {
                            biased;
                            _ = c.cancelled() => return Err(GenRelayError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        },
                        None => tokio::time::sleep(delay).await,
                    }
                }
                e => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        req: &GenerationRequest,
        token: &SecretString,
    ) -> CoreResult<reqwest::Response> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(token.expose_secret())
            .json(req)
            .send()
            .await
            .map_err(|e| GenRelayError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| truncate(&body, 300));
        if status.as_u16() == 400 {
            return Err(GenRelayError::Validation(message));
        }
        Err(GenRelayError::Status {
            status: status.as_u16(),
            message,
        })
    }
}
