//! Bounded fan-out and cancellation helpers

use crate::{EngineError, Result};
use futures_util::stream::{self, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `task` over every item with at most `limit` futures in flight.
///
/// Output order follows completion, not input. If `cancel` fires first, all
/// in-flight work is dropped and nothing is returned. Tasks must own their
/// item and captures for the caller's future to stay `Send`.
pub(crate) async fn bounded_fan_out<I, T, F, Fut>(
    items: I,
    limit: usize,
    cancel: Option<&CancellationToken>,
    task: F,
) -> Result<Vec<T>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = T>,
{
    let work = stream::iter(items)
        .map(task)
        .buffer_unordered(limit.max(1))
        .collect::<Vec<T>>();

    cancellable(cancel, async { Ok(work.await) }).await
}

/// Await `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T, Fut>(cancel: Option<&CancellationToken>, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(EngineError::Cancelled),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}

/// Fail fast if `cancel` has already fired
pub(crate) fn ensure_not_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(EngineError::Cancelled),
        _ => Ok(()),
    }
}
