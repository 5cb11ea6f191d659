use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, GenRelayError};
use crate::framer::{LineFormat, decode_stream};
use crate::http_client::{HttpClient, endpoint_of};
use crate::model::GenerateOptions;
use crate::provider::{TextProvider, with_cancel};
use crate::stream::FragmentStream;

/// Hosted Gemini API. Streaming uses `streamGenerateContent?alt=sse`.
#[derive(Debug, Clone)]
pub struct Gemini {
    http: HttpClient,
    base: String,
    api_key: SecretString,
    default_model: String,
    name: String,
}

impl Gemini {
    pub fn new(http: HttpClient, base: String, api_key: SecretString, default_model: String) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            name: "gemini".into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Gemini::new(
            HttpClient::new_default().unwrap(),
            server_base.to_string(),
            SecretString::from("test-key"),
            "gemini-1.5-flash".into(),
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "x-goog-api-key".to_string(),
                self.api_key.expose_secret().to_string(),
            ),
        ]
    }

    fn url(&self, opts: &GenerateOptions, method: &str) -> String {
        let model = opts.model.as_deref().unwrap_or(&self.default_model);
        format!("{}/v1beta/models/{}:{}", self.base, model, method)
    }

    fn payload<'a>(&self, prompt: &'a str, opts: &GenerateOptions) -> GRequest<'a> {
        GRequest {
            contents: vec![GContent {
                role: "user",
                parts: vec![GPartOut { text: prompt }],
            }],
            generation_config: GGenerationConfig {
                temperature: opts.temperature,
                max_output_tokens: opts.max_tokens,
                response_mime_type: opts.json_mode.then_some("application/json"),
            },
        }
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GRequest<'a> {
    contents: Vec<GContent<'a>>,
    generation_config: GGenerationConfig,
}

#[derive(Serialize)]
struct GContent<'a> {
    role: &'static str,
    parts: Vec<GPartOut<'a>>,
}

#[derive(Serialize)]
struct GPartOut<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GResponse {
    #[serde(default)]
    candidates: Vec<GCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GPromptFeedback>,
}

#[derive(Deserialize)]
struct GCandidate {
    #[serde(default)]
    content: Option<GContentIn>,
}

#[derive(Deserialize)]
struct GContentIn {
    #[serde(default)]
    parts: Vec<GPartIn>,
}

#[derive(Deserialize)]
struct GPartIn {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GResponse {
    /// Text of the first candidate, or the block reason when the prompt was refused.
    fn into_text(self, provider: &str) -> CoreResult<String> {
        if self.candidates.is_empty()
            && let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason)
        {
            return Err(GenRelayError::ProviderProtocol {
                provider: provider.to_string(),
                code: "blocked".into(),
                message: format!("prompt blocked: {reason}"),
            });
        }
        Ok(self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TextProvider for Gemini {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<String> {
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = self.url(opts, "generateContent");
        let resp: GResponse = with_cancel(
            cancel,
            self.http
                .post_json(&self.name, &url, &self.payload(prompt, opts), &hdrs),
        )
        .await?;
        resp.into_text(&self.name)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{}?alt=sse", self.url(opts, "streamGenerateContent"));
        let body = with_cancel(
            &cancel,
            self.http
                .post_stream(&self.name, &url, &self.payload(prompt, opts), &hdrs),
        )
        .await?;

        let endpoint = endpoint_of(&url);
        let provider = self.name.clone();
        let fragments = decode_stream::<_, _, GResponse, _>(
            body,
            LineFormat::EventStream,
            self.http.line_framer(),
            cancel,
            move |_| GenRelayError::ProviderConnection {
                endpoint: endpoint.clone(),
            },
        )
        .filter_map(move |item| {
            let out = match item.and_then(|resp| resp.into_text(&provider)) {
                Ok(text) if text.is_empty() => None,
                other => Some(other),
            };
            futures::future::ready(out)
        });
        Ok(fragments.boxed())
    }
}
