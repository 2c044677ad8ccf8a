//! Bounded-concurrency gate per endpoint, FIFO waiters.
//!
//! `tokio::sync::Semaphore` already gives FIFO-fair acquisition; this is
//! a thin named wrapper so call sites read symmetrically with
//! [`super::rate_limiter::RateLimiter`], e.g. `hc_semaphore.acquire().await`.

use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

pub struct EndpointSemaphore {
    inner: Semaphore,
}

impl EndpointSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Semaphore::new(permits.max(1)),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.inner
            .acquire()
            .await
            .expect("semaphore never closed while holder is alive")
    }
}

pub type SharedSemaphore = Arc<EndpointSemaphore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let sem = Arc::new(EndpointSemaphore::new(1));
        let permit1 = sem.acquire().await;

        let sem2 = sem.clone();
        let handle = tokio::spawn(async move {
            let _permit2 = sem2.acquire().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(permit1);
        handle.await.unwrap();
    }
}
