use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, GenRelayError};
use crate::framer::LineFramer;

/// Raw body of a streaming upstream response.
pub type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
    max_line_bytes: usize,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    /// No client-wide timeout: streams are bounded by the session timer, and
    /// buffered calls get `request_timeout_ms` per request.
    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| GenRelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("genrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            max_line_bytes: cfg.max_line_bytes,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Framer for streaming bodies fetched through this client.
    pub fn line_framer(&self) -> LineFramer {
        LineFramer::with_max_len(self.max_line_bytes)
    }

    /// POST builder with the default headers applied.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.inner.post(url).header("User-Agent", &self.user_agent)
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.inner.get(url).header("User-Agent", &self.user_agent)
    }

    /// POST JSON and decode a JSON response. `provider` labels the errors.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let mut req = self.post(url).json(body).timeout(self.request_timeout);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|e| send_error(url, &e))?;
        let resp = check_status(provider, resp).await?;

        if let Some(ct) = content_type(&resp)
            && !ct.contains("json")
        {
            return Err(GenRelayError::ProviderProtocol {
                provider: provider.to_string(),
                code: resp.status().as_u16().to_string(),
                message: format!("unexpected content type {ct}"),
            });
        }

        let status = resp.status();
        resp.json::<R>()
            .await
            .map_err(|e| GenRelayError::ProviderProtocol {
                provider: provider.to_string(),
                code: status.as_u16().to_string(),
                message: format!("json decode error: {e}"),
            })
    }

    /// POST JSON and return the response body as a raw byte stream.
    /// Framing is left to the caller.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<ByteStream> {
        let mut req = self.post(url).json(body);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|e| send_error(url, &e))?;
        let resp = check_status(provider, resp).await?;
        Ok(Box::pin(resp.bytes_stream()))
    }
}

/// Map a transport failure. Endpoint detail stays in the error for logs.
pub(crate) fn send_error(url: &str, err: &reqwest::Error) -> GenRelayError {
    tracing::debug!(error = %err, timeout = err.is_timeout(), "upstream request failed");
    GenRelayError::ProviderConnection {
        endpoint: endpoint_of(url),
    }
}

/// Scheme, host and port of a URL; never the path or query (keys live there).
pub(crate) fn endpoint_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(u) => {
            let host = u.host_str().unwrap_or_default();
            match u.port() {
                Some(p) => format!("{}://{}:{}", u.scheme(), host, p),
                None => format!("{}://{}", u.scheme(), host),
            }
        }
        Err(_) => url.to_string(),
    }
}

fn content_type(resp: &Response) -> Option<String> {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
}

async fn check_status(provider: &str, resp: Response) -> CoreResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let ra = parse_retry_after(resp.headers());
    let endpoint = endpoint_of(resp.url().as_str());
    let body = resp.text().await.unwrap_or_default();
    Err(map_http_error(provider, &endpoint, status, ra, &body))
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    None
}

fn map_http_error(
    provider: &str,
    endpoint: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> GenRelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenRelayError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => GenRelayError::ProviderConnection {
            endpoint: endpoint.to_string(),
        },
        s => GenRelayError::ProviderProtocol {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
