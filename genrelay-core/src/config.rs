use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::framer::LineFormat;
use crate::model::ProviderKind;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Keep-alive comment cadence on open streams.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Upper bound on a single stream's lifetime.
    #[serde(default = "default_max_stream_secs")]
    pub max_stream_secs: u64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            heartbeat_secs: default_heartbeat_secs(),
            max_stream_secs: default_max_stream_secs(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_heartbeat_secs() -> u64 {
    20
}
fn default_max_stream_secs() -> u64 {
    300
}
fn default_max_prompt_chars() -> usize {
    32_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OllamaCfg {
    #[serde(default = "default_ollama_base")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    /// How the streamed body is framed: bare NDJSON or `data:` lines.
    #[serde(default)]
    pub line_format: LineFormat,
    /// Name of the environment variable holding an optional bearer key
    /// (hosted Ollama-compatible endpoints).
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for OllamaCfg {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base(),
            model: default_ollama_model(),
            line_format: LineFormat::default(),
            api_key_env: None,
        }
    }
}

fn default_ollama_base() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GeminiCfg {
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_gemini_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_gemini_base")]
    pub base_url: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

impl Default for GeminiCfg {
    fn default() -> Self {
        Self {
            api_key_env: default_gemini_key_env(),
            base_url: default_gemini_base(),
            model: default_gemini_model(),
        }
    }
}

fn default_gemini_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_gemini_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Providers {
    #[serde(default = "default_provider")]
    pub default: ProviderKind,
    #[serde(default)]
    pub ollama: Option<OllamaCfg>,
    #[serde(default)]
    pub gemini: Option<GeminiCfg>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            default: default_provider(),
            ollama: Some(OllamaCfg::default()),
            gemini: None,
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Ollama
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Regex applied to the model name, e.g. ^gemini-.*
    pub model: String,
    /// Provider to route to when this rule matches
    pub provider: ProviderKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RoutingCfg {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct AuthCfg {
    /// Environment variable holding `subject:token` pairs, comma separated.
    #[serde(default)]
    pub tokens_env: Option<String>,
    /// External identity endpoint; takes precedence over static tokens.
    #[serde(default)]
    pub verify_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Buffered request timeout in milliseconds (default 120000ms).
    /// Streams are bounded by `server.max_stream_secs` instead.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Longest stream line accepted before the stream is failed (default 1 MiB)
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    120_000
}
fn default_max_line_bytes() -> usize {
    crate::framer::DEFAULT_MAX_LINE_BYTES
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub providers: Providers,
    #[serde(default)]
    pub routing: RoutingCfg,
    #[serde(default)]
    pub auth: AuthCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::GenRelayError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::GenRelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::GenRelayError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::GenRelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::GenRelayError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::GenRelayError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> crate::error::CoreResult<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_from(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Overlay environment-level settings. `lookup` abstracts the environment
    /// so callers (and tests) can supply their own source.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> crate::error::CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GENRELAY_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("GENRELAY_PROVIDER") {
            self.providers.default = v.parse()?;
        }

        if let Some(v) = lookup("OLLAMA_BASE_URL") {
            self.providers.ollama.get_or_insert_with(OllamaCfg::default).base_url = v;
        }
        if let Some(v) = lookup("OLLAMA_MODEL") {
            self.providers.ollama.get_or_insert_with(OllamaCfg::default).model = v;
        }
        if let Some(v) = lookup("OLLAMA_LINE_FORMAT") {
            self.providers.ollama.get_or_insert_with(OllamaCfg::default).line_format = v.parse()?;
        }

        // A key in the environment is enough to enable gemini with defaults.
        let key_env = self
            .providers
            .gemini
            .as_ref()
            .map(|g| g.api_key_env.clone())
            .unwrap_or_else(default_gemini_key_env);
        if lookup(&key_env).is_some() {
            self.providers.gemini.get_or_insert_with(GeminiCfg::default);
        }
        if let Some(v) = lookup("GEMINI_MODEL") {
            self.providers.gemini.get_or_insert_with(GeminiCfg::default).model = v;
        }

        if let Some(v) = lookup("GENRELAY_TOKENS_ENV") {
            self.auth.tokens_env = Some(v);
        }
        if let Some(v) = lookup("GENRELAY_VERIFY_URL") {
            self.auth.verify_url = Some(v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.json");
        let json = r#"{
          "server": {"bind": "0.0.0.0:9000", "max_stream_secs": 120},
          "providers": {
            "default": "gemini",
            "ollama": {"base_url": "http://gpu-box:11434", "line_format": "sse"},
            "gemini": {"api_key_env": "MY_GEMINI_KEY"}
          },
          "routing": {"rules": [{"model": "^llama.*", "provider": "ollama"}]}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.server.max_stream_secs, 120);
        assert_eq!(cfg.server.heartbeat_secs, 20);
        assert_eq!(cfg.providers.default, ProviderKind::Gemini);
        let ollama = cfg.providers.ollama.as_ref().unwrap();
        assert_eq!(ollama.line_format, LineFormat::EventStream);
        assert_eq!(ollama.model, "llama3");
        assert_eq!(cfg.providers.gemini.as_ref().unwrap().api_key_env, "MY_GEMINI_KEY");
        assert_eq!(cfg.routing.rules[0].provider, ProviderKind::Ollama);
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 120_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
        assert_eq!(cfg.http.max_line_bytes, 1024 * 1024);
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/genrelay-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            crate::error::GenRelayError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, vec![0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        match err {
            crate::error::GenRelayError::Other(_) => {}
            other => panic!("expected Other(utf8) error, got: {:?}", other),
        }
    }

    #[test]
    fn unknown_provider_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        fs::write(&file, r#"{"providers": {"default": "openai"}}"#).unwrap();
        assert!(Config::from_path(&file).is_err());
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.toml");
        let toml = r#"
[server]
heartbeat_secs = 15

[providers]
default = "ollama"

[providers.ollama]
model = "mistral"

[auth]
verify_url = "https://id.example.com/verify"

[[routing.rules]]
model = "^gemini-.*"
provider = "gemini"
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.server.heartbeat_secs, 15);
        assert_eq!(cfg.server.max_stream_secs, 300);
        assert_eq!(cfg.providers.ollama.as_ref().unwrap().model, "mistral");
        assert!(cfg.providers.gemini.is_none());
        assert_eq!(cfg.auth.verify_url.as_deref(), Some("https://id.example.com/verify"));
        assert_eq!(cfg.routing.rules.len(), 1);
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("relay.conf");
        fs::write(&json_path, r#"{"server":{"max_prompt_chars":100}}"#).unwrap();
        let cfg = Config::from_path(&json_path).unwrap();
        assert_eq!(cfg.server.max_prompt_chars, 100);

        let toml_path = dir.path().join("relay2.conf");
        fs::write(&toml_path, "[server]\nmax_prompt_chars = 200\n").unwrap();
        let cfg = Config::from_path(&toml_path).unwrap();
        assert_eq!(cfg.server.max_prompt_chars, 200);
    }

    #[test]
    fn env_overlay() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GENRELAY_PROVIDER", "gemini"),
            ("OLLAMA_MODEL", "qwen2"),
            ("OLLAMA_LINE_FORMAT", "sse"),
            ("GEMINI_API_KEY", "k"),
            ("GEMINI_MODEL", "gemini-2.0-flash"),
            ("GENRELAY_TOKENS_ENV", "RELAY_TOKENS"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.providers.default, ProviderKind::Gemini);
        let ollama = cfg.providers.ollama.as_ref().unwrap();
        assert_eq!(ollama.model, "qwen2");
        assert_eq!(ollama.line_format, LineFormat::EventStream);
        assert_eq!(ollama.base_url, "http://localhost:11434");
        assert_eq!(cfg.providers.gemini.as_ref().unwrap().model, "gemini-2.0-flash");
        assert_eq!(cfg.auth.tokens_env.as_deref(), Some("RELAY_TOKENS"));
    }

    #[test]
    fn env_overlay_rejects_bad_values() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_from(|k| (k == "OLLAMA_LINE_FORMAT").then(|| "xml".to_string()))
            .unwrap_err();
        assert!(matches!(err, crate::error::GenRelayError::Validation(_)));
    }
}
