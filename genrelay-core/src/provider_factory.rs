use std::{collections::HashMap, sync::Arc};

use secrecy::SecretString;

use crate::config::Config;
use crate::error::{CoreResult, GenRelayError};
use crate::http_client::HttpClient;
use crate::model::ProviderKind;
use crate::provider::TextProvider;
use crate::providers::gemini::Gemini;
use crate::providers::ollama::Ollama;

/// Registry of concrete provider instances, built once at startup.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn TextProvider>>,
    default: ProviderKind,
}

impl ProviderRegistry {
    /// Build a registry from configuration, reading credentials from the process env.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Self::from_config_with(cfg, |k| std::env::var(k).ok())
    }

    /// Same as `from_config`, with credentials resolved through `lookup`.
    pub fn from_config_with<F>(cfg: &Config, lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http = HttpClient::from_cfg(&cfg.http)?;
        let mut providers: HashMap<ProviderKind, Arc<dyn TextProvider>> = HashMap::new();

        if let Some(o) = &cfg.providers.ollama {
            let api_key = o
                .api_key_env
                .as_deref()
                .and_then(&lookup)
                .map(SecretString::from);
            let ollama = Ollama::new(
                http.clone(),
                o.base_url.clone(),
                o.model.clone(),
                o.line_format,
                api_key,
            );
            providers.insert(ProviderKind::Ollama, Arc::new(ollama));
        }

        if let Some(g) = &cfg.providers.gemini {
            let key = lookup(&g.api_key_env).ok_or_else(|| {
                GenRelayError::Validation(format!(
                    "gemini is configured but {} is not set",
                    g.api_key_env
                ))
            })?;
            let gemini = Gemini::new(
                http.clone(),
                g.base_url.clone(),
                SecretString::from(key),
                g.model.clone(),
            );
            providers.insert(ProviderKind::Gemini, Arc::new(gemini));
        }

        let default = cfg.providers.default;
        if !providers.contains_key(&default) {
            return Err(GenRelayError::Validation(format!(
                "default provider '{default}' is not configured"
            )));
        }
        tracing::info!(
            default = %default,
            configured = ?providers.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            "provider registry ready"
        );
        Ok(Self { providers, default })
    }

    /// Registry over pre-built providers. Used by tests and embedders.
    pub fn with_providers<I>(default: ProviderKind, providers: I) -> Self
    where
        I: IntoIterator<Item = (ProviderKind, Arc<dyn TextProvider>)>,
    {
        Self {
            providers: providers.into_iter().collect(),
            default,
        }
    }

    pub fn default_kind(&self) -> ProviderKind {
        self.default
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn TextProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }
}
