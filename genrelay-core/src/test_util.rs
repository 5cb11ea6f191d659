//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, GenRelayError};
use crate::model::GenerateOptions;
use crate::provider::{TextProvider, with_cancel};
use crate::stream::FragmentStream;

/// What happens after the scripted fragments are exhausted.
#[derive(Clone, Copy)]
pub enum Tail {
    End,
    Fail(fn() -> GenRelayError),
    /// Never finishes; only cancellation ends it.
    Hang,
}

/// Provider that replays a fixed script and records how it was driven.
pub struct ScriptedProvider {
    name: String,
    fragments: Vec<String>,
    tail: Tail,
    calls: AtomicUsize,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new(name: &str, fragments: &[&str], tail: Tail) -> Self {
        Self {
            name: name.to_string(),
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            tail,
            calls: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fragments(name: &str, fragments: &[&str]) -> Self {
        Self::new(name, fragments, Tail::End)
    }

    pub fn hanging(name: &str) -> Self {
        Self::new(name, &[], Tail::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// True once a token handed to this provider has fired.
    pub fn saw_cancel(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn watch(&self, cancel: &CancellationToken) {
        let token = cancel.clone();
        let flag = self.cancelled.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
    }
}

pub fn connection_refused() -> GenRelayError {
    GenRelayError::ProviderConnection {
        endpoint: "http://10.1.2.3:11434".into(),
    }
}

#[async_trait]
impl TextProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        _prompt: &str,
        _opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.watch(cancel);
        let text = self.fragments.concat();
        let tail = self.tail;
        with_cancel(cancel, async move {
            match tail {
                Tail::End => Ok(text),
                Tail::Fail(make) => Err(make()),
                Tail::Hang => std::future::pending().await,
            }
        })
        .await
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _opts: &GenerateOptions,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.watch(&cancel);
        let fragments = self.fragments.clone();
        let tail = self.tail;
        let s = async_stream::stream! {
            for f in fragments {
                if cancel.is_cancelled() {
                    yield Err(GenRelayError::Cancelled);
                    return;
                }
                yield Ok(f);
            }
            match tail {
                Tail::End => {}
                Tail::Fail(make) => {
                    yield Err(make());
                }
                Tail::Hang => {
                    cancel.cancelled().await;
                    yield Err(GenRelayError::Cancelled);
                }
            }
        };
        Ok(s.boxed())
    }
}
