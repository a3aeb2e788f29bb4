//! Scoped acquisition of long-lived resources.
//!
//! A resource is acquired on entry and released on every exit path. Release
//! is graceful first; under cancellation it is bounded by a grace period and
//! escalates to a forced stop when the graceful path fails or overruns.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Something that must be released exactly once for every acquisition.
#[async_trait::async_trait]
pub trait ScopedResource: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the resource up. May fail part-way; `release` must still be
    /// safe afterwards.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<()>;

    /// Graceful stop.
    async fn release(&self) -> Result<()>;

    /// Forced stop, used when the graceful one fails or times out.
    async fn force_release(&self) -> Result<()>;

    /// True from the start of `acquire` until a release attempt completes.
    fn is_held(&self) -> bool;
}

/// How a release attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Graceful,
    Forced,
    Failed(String),
}

/// Release `res`, bounding the graceful stop by `grace` when given and
/// escalating to a forced stop if it errors or times out.
pub async fn release_within<R>(res: &R, grace: Option<Duration>) -> ReleaseOutcome
where
    R: ScopedResource + ?Sized,
{
    let graceful = match grace {
        Some(g) => match tokio::time::timeout(g, res.release()).await {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!(
                "graceful stop exceeded {}s grace period",
                g.as_secs()
            )),
        },
        None => res.release().await,
    };

    match graceful {
        Ok(()) => ReleaseOutcome::Graceful,
        Err(e) => {
            tracing::warn!(resource = res.name(), error = %format!("{e:#}"), "graceful stop failed, forcing");
            match res.force_release().await {
                Ok(()) => ReleaseOutcome::Forced,
                Err(fe) => {
                    tracing::error!(resource = res.name(), error = %format!("{fe:#}"), "forced stop failed");
                    ReleaseOutcome::Failed(format!("{e:#}; forced stop: {fe:#}"))
                }
            }
        }
    }
}

/// Result of running a body inside a scoped acquisition.
#[derive(Debug)]
pub enum Scoped<T> {
    Ran(T),
    AcquireFailed(anyhow::Error),
}

/// Acquire `res`, run `body` if that succeeded, and release `res` whatever
/// happened. The grace period applies only when `cancel` has fired by the
/// time of release.
pub async fn scoped<R, T, F, Fut>(
    res: &R,
    cancel: &CancellationToken,
    grace: Duration,
    body: F,
) -> (Scoped<T>, ReleaseOutcome)
where
    R: ScopedResource + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let result = match res.acquire(cancel).await {
        Ok(()) => Scoped::Ran(body().await),
        Err(e) => Scoped::AcquireFailed(e),
    };
    let bound = cancel.is_cancelled().then_some(grace);
    let released = release_within(res, bound).await;
    (result, released)
}
