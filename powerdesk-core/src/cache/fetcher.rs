//! Fetch collaborator boundary for the cache accessor

use async_trait::async_trait;
use std::future::Future;

/// Produces a fresh value for one cache key.
///
/// Implementations must be idempotent and must not leave partial writes
/// behind on failure: background revalidation may call them repeatedly.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn fetch(&self) -> anyhow::Result<T> {
        (self)().await
    }
}
