use std::future::Future;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, GenRelayError};
use crate::model::GenerateOptions;
use crate::stream::FragmentStream;

/// Uniform interface to a text-generation backend.
///
/// The relay only ever talks to this trait, so backends are interchangeable.
#[async_trait]
pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Buffered generation: one upstream call, complete text.
    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<String>;

    /// Incremental generation. Implementations must check `cancel` on every
    /// read and end with `Err(Cancelled)` once it fires.
    async fn generate_stream(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        // default: call generate once and wrap it
        let text = self.generate(prompt, opts, &cancel).await?;
        Ok(stream::iter([Ok(text)]).boxed())
    }
}

/// Race `fut` against the token; a fired token wins with `Cancelled`.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenRelayError::Cancelled),
        r = fut => r,
    }
}
