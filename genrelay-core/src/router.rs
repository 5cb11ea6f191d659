use std::sync::Arc;

use regex::Regex;

use crate::config::{Config, RoutingRule};
use crate::error::{CoreResult, GenRelayError};
use crate::model::ProviderKind;
use crate::provider::TextProvider;
use crate::provider_factory::ProviderRegistry;

/// Compiled routing rule
#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    provider: ProviderKind,
}

/// Picks the provider for a request: explicit override, then the first
/// matching model rule, then the registry default.
#[derive(Debug, Default)]
pub struct RoutingResolver {
    rules: Vec<CompiledRule>,
}

impl RoutingResolver {
    /// Build a resolver by compiling regexes from config.
    pub fn new(cfg: &Config) -> CoreResult<Self> {
        let mut rules = Vec::new();
        for RoutingRule { model, provider } in &cfg.routing.rules {
            let regex = Regex::new(model).map_err(|e| {
                GenRelayError::Validation(format!("invalid routing regex '{model}': {e}"))
            })?;
            rules.push(CompiledRule {
                regex,
                provider: *provider,
            });
        }
        Ok(Self { rules })
    }

    pub fn pick(
        &self,
        default: ProviderKind,
        explicit: Option<ProviderKind>,
        model: Option<&str>,
    ) -> ProviderKind {
        if let Some(kind) = explicit {
            return kind;
        }
        if let Some(model) = model {
            for r in &self.rules {
                if r.regex.is_match(model) {
                    return r.provider;
                }
            }
        }
        default
    }

    /// Resolve to a live provider. Runs before any upstream call.
    pub fn select(
        &self,
        reg: &ProviderRegistry,
        explicit: Option<ProviderKind>,
        model: Option<&str>,
    ) -> CoreResult<Arc<dyn TextProvider>> {
        let kind = self.pick(reg.default_kind(), explicit, model);
        reg.get(kind).ok_or_else(|| {
            GenRelayError::Validation(format!("provider '{kind}' is not configured"))
        })
    }
}
