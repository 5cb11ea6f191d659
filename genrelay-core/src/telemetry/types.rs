use std::fmt;

use serde::{Deserialize, Serialize};

/// How a relay stream session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Done,
    Error,
    Timeout,
    Cancelled,
    /// The client went away before a terminal event was written.
    Disconnected,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per terminated stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLog {
    pub session_id: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub subject: Option<String>,
    pub outcome: SessionOutcome,
    pub chunks: u64,
    pub latency_ms: u64,
    pub error_kind: Option<String>,
}

impl SessionLog {
    pub fn new(session_id: impl Into<String>, outcome: SessionOutcome) -> Self {
        Self {
            session_id: session_id.into(),
            provider: None,
            model: None,
            subject: None,
            outcome,
            chunks: 0,
            latency_ms: 0,
            error_kind: None,
        }
    }
    pub fn provider(mut self, v: &str) -> Self {
        self.provider = Some(v.to_string());
        self
    }
    pub fn model_opt(mut self, v: Option<&str>) -> Self {
        self.model = v.map(|s| s.to_string());
        self
    }
    pub fn subject(mut self, v: &str) -> Self {
        self.subject = Some(v.to_string());
        self
    }
    pub fn chunks(mut self, n: u64) -> Self {
        self.chunks = n;
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }
    pub fn error_kind_opt(mut self, v: Option<&str>) -> Self {
        self.error_kind = v.map(|s| s.to_string());
        self
    }
}
