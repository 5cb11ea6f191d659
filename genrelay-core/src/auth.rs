//! Bearer-token authentication for relay requests.
//!
//! Verification itself belongs to an external identity service; the relay
//! only sees it through [`TokenVerifier`].

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::AuthCfg;
use crate::error::{CoreResult, GenRelayError};
use crate::http_client::HttpClient;

/// Verified caller identity. Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> CoreResult<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| GenRelayError::Authentication("missing bearer token".into()))?;
    let value = value
        .to_str()
        .map_err(|_| GenRelayError::Authentication("malformed authorization header".into()))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| GenRelayError::Authentication("malformed authorization header".into()))?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(GenRelayError::Authentication(
            "malformed authorization header".into(),
        ));
    }
    Ok(token)
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> CoreResult<Principal>;
}

/// Fixed `subject:token` pairs, typically loaded from an env var.
pub struct StaticTokenVerifier {
    tokens: Vec<(String, SecretString)>,
}

impl StaticTokenVerifier {
    /// Parse a comma-separated `subject:token` list.
    pub fn from_pairs(list: &str) -> CoreResult<Self> {
        let mut tokens = Vec::new();
        for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (subject, token) = pair.split_once(':').ok_or_else(|| {
                GenRelayError::Validation("token entries must look like subject:token".into())
            })?;
            if subject.is_empty() || token.is_empty() {
                return Err(GenRelayError::Validation(
                    "token entries must look like subject:token".into(),
                ));
            }
            tokens.push((subject.to_string(), SecretString::from(token.to_string())));
        }
        if tokens.is_empty() {
            return Err(GenRelayError::Validation("no tokens configured".into()));
        }
        Ok(Self { tokens })
    }

    pub fn from_env_var(name: &str) -> CoreResult<Self> {
        let list = std::env::var(name)
            .map_err(|_| GenRelayError::Validation(format!("{name} is not set")))?;
        Self::from_pairs(&list)
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> CoreResult<Principal> {
        self.tokens
            .iter()
            .find(|(_, t)| t.expose_secret() == token)
            .map(|(subject, _)| Principal {
                subject: subject.clone(),
            })
            .ok_or_else(|| GenRelayError::Authentication("invalid or expired token".into()))
    }
}

/// Delegates to an identity endpoint: `GET verify_url` with the caller's token.
pub struct RemoteTokenVerifier {
    http: HttpClient,
    url: String,
}

#[derive(Deserialize)]
struct VerifyResp {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    uid: Option<String>,
}

impl RemoteTokenVerifier {
    pub fn new(http: HttpClient, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl TokenVerifier for RemoteTokenVerifier {
    async fn verify(&self, token: &str) -> CoreResult<Principal> {
        let resp = self
            .http
            .get(&self.url)
            .bearer_auth(token)
            .timeout(self.http.request_timeout())
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "identity service unreachable");
                GenRelayError::Network("identity service unreachable".into())
            })?;
        match resp.status() {
            StatusCode::OK => {
                let body: VerifyResp = resp.json().await.map_err(|e| {
                    GenRelayError::Authentication(format!("unreadable identity response: {e}"))
                })?;
                body.sub
                    .or(body.uid)
                    .filter(|s| !s.is_empty())
                    .map(|subject| Principal { subject })
                    .ok_or_else(|| GenRelayError::Authentication("identity has no subject".into()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                GenRelayError::Authentication("invalid or expired token".into()),
            ),
            s => Err(GenRelayError::Network(format!(
                "identity service returned {}",
                s.as_u16()
            ))),
        }
    }
}

/// Pick the verifier named by config. A remote endpoint wins over static tokens.
pub fn verifier_from_config(cfg: &AuthCfg, http: &HttpClient) -> CoreResult<Arc<dyn TokenVerifier>> {
    if let Some(url) = &cfg.verify_url {
        return Ok(Arc::new(RemoteTokenVerifier::new(http.clone(), url.clone())));
    }
    if let Some(var) = &cfg.tokens_env {
        return Ok(Arc::new(StaticTokenVerifier::from_env_var(var)?));
    }
    Err(GenRelayError::Validation(
        "auth needs verify_url or tokens_env".into(),
    ))
}
