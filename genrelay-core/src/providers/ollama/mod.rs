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

/// Ollama-style backend: `/api/generate`, NDJSON when streaming.
#[derive(Debug, Clone)]
pub struct Ollama {
    http: HttpClient,
    base: String,
    default_model: String,
    line_format: LineFormat,
    api_key: Option<SecretString>,
    name: String,
}

impl Ollama {
    pub fn new(
        http: HttpClient,
        base: String,
        default_model: String,
        line_format: LineFormat,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            default_model,
            line_format,
            api_key,
            name: "ollama".into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str, line_format: LineFormat) -> Self {
        Ollama::new(
            HttpClient::new_default().unwrap(),
            server_base.to_string(),
            "llama3".into(),
            line_format,
            None,
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.api_key {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            ));
        }
        h
    }

    fn url(&self) -> String {
        format!("{}/api/generate", self.base)
    }

    fn payload<'a>(&'a self, prompt: &'a str, opts: &'a GenerateOptions, stream: bool) -> OGenerateReq<'a> {
        OGenerateReq {
            model: opts.model.as_deref().unwrap_or(&self.default_model),
            prompt,
            stream,
            options: OOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens,
            },
            format: opts.json_mode.then_some("json"),
        }
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OGenerateReq<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Serialize)]
struct OOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// One buffered response or one streamed line.
#[derive(Deserialize)]
struct OChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl TextProvider for Ollama {
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
        let payload = self.payload(prompt, opts, false);
        let url = self.url();
        let resp: OChunk = with_cancel(
            cancel,
            self.http.post_json(&self.name, &url, &payload, &hdrs),
        )
        .await?;
        if let Some(err) = resp.error {
            return Err(GenRelayError::ProviderProtocol {
                provider: self.name.clone(),
                code: "error".into(),
                message: err,
            });
        }
        Ok(resp.response)
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
        let payload = self.payload(prompt, opts, true);
        let url = self.url();
        let body = with_cancel(
            &cancel,
            self.http.post_stream(&self.name, &url, &payload, &hdrs),
        )
        .await?;

        let endpoint = endpoint_of(&url);
        let provider = self.name.clone();
        let mut chunks = decode_stream::<_, _, OChunk, _>(
            body,
            self.line_format,
            self.http.line_framer(),
            cancel,
            move |_| GenRelayError::ProviderConnection {
                endpoint: endpoint.clone(),
            },
        );
        // `done: true` is the last line of a generation even if the body stays open
        let fragments = async_stream::stream! {
            while let Some(item) = chunks.next().await {
                match item {
                    Ok(OChunk { error: Some(err), .. }) => {
                        yield Err(GenRelayError::ProviderProtocol {
                            provider: provider.clone(),
                            code: "error".into(),
                            message: err,
                        });
                        return;
                    }
                    Ok(chunk) => {
                        if !chunk.response.is_empty() {
                            yield Ok(chunk.response);
                        }
                        if chunk.done {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Ok(fragments.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    async fn collect(stream: FragmentStream) -> Vec<CoreResult<String>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn generate_200_returns_response_text() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body(json!({
                    "model": "llama3",
                    "prompt": "Say hi",
                    "stream": false,
                    "options": {"temperature": 0.5, "num_predict": 32}
                }));
            then.status(200)
                .json_body(json!({"response": "Hello", "done": true}));
        });

        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let opts = GenerateOptions {
            temperature: Some(0.5),
            max_tokens: Some(32),
            ..Default::default()
        };
        let text = provider
            .generate("Say hi", &opts, &CancellationToken::new())
            .await
            .expect("generate ok");
        assert_eq!(text, "Hello");
        m.assert();
    }

    #[tokio::test]
    async fn json_mode_and_model_override_are_forwarded() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"model":"mistral","format":"json"}"#);
            then.status(200).json_body(json!({"response": "{}", "done": true}));
        });

        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let opts = GenerateOptions {
            model: Some("mistral".into()),
            json_mode: true,
            ..Default::default()
        };
        provider
            .generate("x", &opts, &CancellationToken::new())
            .await
            .unwrap();
        m.assert();
    }

    #[tokio::test]
    async fn stream_yields_ndjson_fragments_in_order() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"stream":true}"#);
            then.status(200)
                .header("content-type", "application/x-ndjson")
                .body(concat!(
                    "{\"response\":\"He\",\"done\":false}\n",
                    "garbage line\n",
                    "{\"response\":\"llo\",\"done\":false}\n",
                    "{\"response\":\"\",\"done\":true}\n"
                ));
        });

        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let frags = collect(
            provider
                .generate_stream("Say hi", &GenerateOptions::default(), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        let frags: Vec<String> = frags.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frags, vec!["He", "llo"]);
    }

    #[tokio::test]
    async fn stream_stops_at_done_line() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200).body(concat!(
                "{\"response\":\"Hi\",\"done\":false}\n",
                "{\"response\":\"!\",\"done\":true}\n",
                "{\"response\":\"stray\",\"done\":false}\n"
            ));
        });

        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let frags = collect(
            provider
                .generate_stream("x", &GenerateOptions::default(), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        let frags: Vec<String> = frags.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frags, vec!["Hi", "!"]);
    }

    #[tokio::test]
    async fn oversized_stream_line_fails_the_stream() {
        let server = MockServer::start();
        let long = format!("{{\"response\":\"{}\"}}\n", "x".repeat(256));
        let _m = server.mock(move |when, then| {
            when.method(POST).path("/api/generate");
            then.status(200)
                .body(format!("{{\"response\":\"a\"}}\n{long}{{\"response\":\"b\"}}\n"));
        });

        let http = HttpClient::from_cfg(&crate::config::HttpCfg {
            max_line_bytes: 64,
            ..Default::default()
        })
        .unwrap();
        let provider = Ollama::new(
            http,
            server.base_url(),
            "llama3".into(),
            LineFormat::JsonLines,
            None,
        );
        let frags = collect(
            provider
                .generate_stream("x", &GenerateOptions::default(), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].as_ref().unwrap(), "a");
        assert!(matches!(frags[1], Err(GenRelayError::LineTooLong { limit: 64 })));
    }

    #[tokio::test]
    async fn stream_accepts_event_stream_framing() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: {\"response\":\"a\"}\n\n: ping\n\ndata: {\"response\":\"b\"}\n\n");
        });

        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::EventStream);
        let frags = collect(
            provider
                .generate_stream("x", &GenerateOptions::default(), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        let frags: Vec<String> = frags.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stream_error_line_is_protocol_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200)
                .body("{\"response\":\"a\"}\n{\"error\":\"model ran out of memory\"}\n");
        });

        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let frags = collect(
            provider
                .generate_stream("x", &GenerateOptions::default(), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(frags.len(), 2);
        assert!(matches!(frags[1], Err(GenRelayError::ProviderProtocol { .. })));
    }

    #[tokio::test]
    async fn not_found_model_is_protocol_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(404).body("{\"error\":\"model 'nope' not found\"}");
        });
        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let err = provider
            .generate("x", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GenRelayError::ProviderProtocol { code, .. } => assert_eq!(code, "404"),
            other => panic!("expected ProviderProtocol, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_distinguished() {
        let provider = Ollama::new_for_tests("http://127.0.0.1:9", LineFormat::JsonLines);
        let err = provider
            .generate_stream("x", &GenerateOptions::default(), CancellationToken::new())
            .await
            .err()
            .expect("connect should fail");
        assert_eq!(err.to_string(), "cannot connect to provider at http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn cancelled_before_call_makes_no_request() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200).json_body(json!({"response": "late"}));
        });
        let provider = Ollama::new_for_tests(&server.base_url(), LineFormat::JsonLines);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider
            .generate("x", &GenerateOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(m.hits(), 0);
    }
}
