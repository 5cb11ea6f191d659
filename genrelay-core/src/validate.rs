use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::error::{CoreResult, GenRelayError};
use crate::model::{GenerateOptions, GenerationRequest, ProviderKind, ValidatedRequest};

pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);
pub const MAX_TOKENS_RANGE: (u32, u32) = (1, 8_000);
pub const MAX_MODEL_CHARS: usize = 128;

static MODEL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:/-]+$").expect("static regex"));

/// Ceilings enforced on incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_prompt_chars: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 32_000,
        }
    }
}

pub fn clean_prompt(s: &str) -> String {
    // Unicode NFC normalization + NUL/BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().filter(|c| *c != '\0').collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Sanitize and check a request. Out-of-range values are rejected, never clamped.
pub fn validate_request(
    req: GenerationRequest,
    limits: &RequestLimits,
) -> CoreResult<ValidatedRequest> {
    let prompt = clean_prompt(&req.prompt);
    if prompt.is_empty() {
        return Err(GenRelayError::Validation("prompt must not be empty".into()));
    }
    let chars = prompt.chars().count();
    if chars > limits.max_prompt_chars {
        return Err(GenRelayError::Validation(format!(
            "prompt must be at most {} characters (got {chars})",
            limits.max_prompt_chars
        )));
    }

    if let Some(t) = req.temperature
        && !(t.is_finite() && t >= TEMPERATURE_RANGE.0 && t <= TEMPERATURE_RANGE.1)
    {
        return Err(GenRelayError::Validation(format!(
            "temperature must be between {:.1} and {:.1}",
            TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1
        )));
    }

    if let Some(n) = req.max_tokens
        && !(MAX_TOKENS_RANGE.0..=MAX_TOKENS_RANGE.1).contains(&n)
    {
        return Err(GenRelayError::Validation(format!(
            "maxTokens must be between {} and {}",
            MAX_TOKENS_RANGE.0, MAX_TOKENS_RANGE.1
        )));
    }

    let model = match req.model.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(m) if m.len() > MAX_MODEL_CHARS => {
            return Err(GenRelayError::Validation(format!(
                "model must be at most {MAX_MODEL_CHARS} characters"
            )));
        }
        Some(m) if !MODEL_ID.is_match(m) => {
            return Err(GenRelayError::Validation(
                "model may only contain letters, digits and . _ : / -".into(),
            ));
        }
        Some(m) => Some(m.to_string()),
    };

    let provider = match req.provider.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(p) => Some(p.parse::<ProviderKind>()?),
    };

    Ok(ValidatedRequest {
        prompt,
        options: GenerateOptions {
            model,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            json_mode: req.json_mode.unwrap_or(false),
        },
        provider,
    })
}

/// JSON-mode post-processing for buffered responses: strip a Markdown code
/// fence if the model added one and require the rest to parse as JSON.
pub fn extract_json(provider: &str, text: &str) -> CoreResult<String> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(_) => Ok(body.to_string()),
        Err(e) => Err(GenRelayError::ProviderProtocol {
            provider: provider.to_string(),
            code: "json_mode".into(),
            message: format!("response is not valid JSON: {e}"),
        }),
    }
}
