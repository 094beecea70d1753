//! Bounded retries with recovery between attempts

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::Result;

/// A resource that can be brought back to a usable state after a failed operation,
/// e.g. by dropping a broken connection and opening a new one.
#[async_trait]
pub trait Recover: Send {
    async fn recover(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause after each recovery
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` against `resource` until it succeeds or the attempts are used up.
    ///
    /// Between attempts the resource is recovered and the backoff awaited. A failed recovery
    /// is logged and the next attempt proceeds anyway; the last error of `op` is returned.
    /// The returned future is boxed and `Send` so callers can live inside spawned tasks.
    pub fn run<'s, R, T, F>(
        &'s self,
        label: &'s str,
        resource: &'s mut R,
        mut op: F,
    ) -> BoxFuture<'s, Result<T>>
    where
        R: Recover + ?Sized,
        T: Send + 's,
        F: for<'a> FnMut(&'a mut R) -> BoxFuture<'a, Result<T>> + Send + 's,
    {
        Box::pin(async move {
            let max_attempts = self.max_attempts.max(1);
            let mut attempt = 1;

            loop {
                match op(&mut *resource).await {
                    Ok(value) => return Ok(value),
                    Err(e) if attempt >= max_attempts => {
                        error!("{} failed after {} attempts: {}", label, attempt, e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(
                            "{} failed (attempt {}/{}): {}, recovering",
                            label, attempt, max_attempts, e
                        );
                        if let Err(recover_err) = resource.recover().await {
                            warn!("Recovery before retrying {} failed: {}", label, recover_err);
                        }
                        tokio::time::sleep(self.backoff).await;
                        attempt += 1;
                    }
                }
            }
        })
    }
}
