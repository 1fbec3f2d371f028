//! Retry wrapper around a resource store. The engine only ever sees the
//! final success or failure.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::batch::{BatchItem, BatchResult};
use crate::ports::ResourceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// At most `attempts` calls in total.
    Bounded { attempts: u32, delay: Duration },
    Unbounded { delay: Duration },
}

impl RetryPolicy {
    fn delay(&self) -> Duration {
        match self {
            Self::Bounded { delay, .. } | Self::Unbounded { delay } => *delay,
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        match self {
            Self::Bounded { attempts, .. } => attempt < *attempts,
            Self::Unbounded { .. } => true,
        }
    }
}

pub struct RetryingResourceStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ResourceStore> RetryingResourceStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for RetryingResourceStore<S> {
    async fn execute_batch(&self, items: &[BatchItem]) -> Result<Vec<BatchResult>> {
        let mut attempt = 1;
        loop {
            match self.inner.execute_batch(items).await {
                Ok(results) => return Ok(results),
                Err(e) if self.policy.allows(attempt) => {
                    tracing::warn!(
                        "resource store call failed (attempt {}): {:#}; retrying in {:?}",
                        attempt,
                        e,
                        self.policy.delay()
                    );
                    tokio::time::sleep(self.policy.delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("resource store failed after {attempt} attempt(s)")))
                }
            }
        }
    }
}
