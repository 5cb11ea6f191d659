//! Streaming primitives exposed by genrelay.
//!
//! Contract:
//! - A relay stream emits 0..n `Chunk` events followed by exactly one terminal
//!   event: `Done` or `Error`.
//! - After a terminal event, no further events are emitted.

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// What the caller receives incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Partial generated text.
    Chunk(String),
    /// Generation finished normally.
    Done,
    /// Generation failed; carries a sanitized message.
    Error(String),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Done` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Convenience accessor for `Chunk` contents.
    pub fn as_chunk(&self) -> Option<&str> {
        match self {
            Self::Chunk(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn to_frame(&self) -> StreamFrame {
        match self {
            Self::Chunk(text) => StreamFrame {
                chunk: Some(text.clone()),
                done: false,
                error: None,
            },
            Self::Done => StreamFrame {
                chunk: Some(String::new()),
                done: true,
                error: None,
            },
            Self::Error(msg) => StreamFrame {
                chunk: None,
                done: true,
                error: Some(msg.clone()),
            },
        }
    }
}

/// Wire form of one event: the JSON after `data: ` on the event stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct StreamFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFrame {
    pub fn to_json(&self) -> String {
        // Only strings and a bool; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"done":true}"#))
    }

    /// Split a received frame into the events it carries, in order.
    /// A final frame may carry trailing text alongside `done: true`.
    pub fn into_events(self) -> Vec<StreamEvent> {
        if let Some(err) = self.error {
            return vec![StreamEvent::Error(err)];
        }
        let mut out = Vec::with_capacity(2);
        if let Some(text) = self.chunk
            && !text.is_empty()
        {
            out.push(StreamEvent::Chunk(text));
        }
        if self.done {
            out.push(StreamEvent::Done);
        }
        out
    }
}

/// Boxed stream of text fragments. Provider adapters return this.
pub type FragmentStream = futures::stream::BoxStream<'static, CoreResult<String>>;
