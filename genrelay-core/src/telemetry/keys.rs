/// Span/Log attribute keys for relay sessions.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_SESSION_ID: &str = "session.id";
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_SUBJECT: &str = "auth.subject";

pub const KEY_OUTCOME: &str = "stream.outcome";
pub const KEY_CHUNKS: &str = "stream.chunks";
pub const KEY_LATENCY_MS: &str = "latency.ms";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
