use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::model::{BookedSlot, SlotId, Span};

use super::{SlotStore, StoreError, TokenSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound on every single store call.
    pub timeout: Duration,
    /// Extra attempts for reads that fail with `Unavailable`. Writes never retry.
    pub read_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            read_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// The engine's only path to storage: every call is time-bounded, and reads
/// are retried with exponential backoff.
///
/// A write that times out may or may not have committed, so writes surface
/// `Unavailable` at once and the caller must re-query before trying again.
pub struct StoreGateway {
    slots: Arc<dyn SlotStore>,
    tokens: Arc<dyn TokenSource>,
    policy: RetryPolicy,
}

impl StoreGateway {
    pub fn new(
        slots: Arc<dyn SlotStore>,
        tokens: Arc<dyn TokenSource>,
        policy: RetryPolicy,
    ) -> Self {
        Self { slots, tokens, policy }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.policy.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL, "op" => op)
                    .increment(1);
                Err(StoreError::Unavailable(format!(
                    "{op} timed out after {}ms",
                    self.policy.timeout.as_millis()
                )))
            }
        }
    }

    async fn read<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delay = self.policy.backoff;
        let mut attempt = 0;
        loop {
            match self.bounded(op, call()).await {
                Err(StoreError::Unavailable(msg)) if attempt < self.policy.read_retries => {
                    attempt += 1;
                    warn!("{op}: {msg}; retry {attempt}/{} in {delay:?}", self.policy.read_retries);
                    metrics::counter!(crate::observability::STORE_RETRIES_TOTAL, "op" => op)
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    pub async fn query_overlap(
        &self,
        host_email: &str,
        span: Span,
    ) -> Result<Vec<BookedSlot>, StoreError> {
        self.read("query_overlap", || self.slots.query_overlap(host_email, span))
            .await
    }

    pub async fn get_slot(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError> {
        self.read("get_slot", || self.slots.get(id)).await
    }

    pub async fn slots_for_host(
        &self,
        host_email: &str,
        window: Option<Span>,
    ) -> Result<Vec<BookedSlot>, StoreError> {
        self.read("slots_for_host", || self.slots.slots_for_host(host_email, window))
            .await
    }

    pub async fn schedule_token(&self, host_email: &str) -> Result<Option<String>, StoreError> {
        self.read("schedule_token", || self.tokens.schedule_token(host_email))
            .await
    }

    pub async fn api_tokens(&self) -> Result<Vec<String>, StoreError> {
        self.read("api_tokens", || self.tokens.api_tokens()).await
    }

    pub async fn insert_if_free(
        &self,
        host_email: &str,
        span: Span,
    ) -> Result<BookedSlot, StoreError> {
        self.bounded("insert_if_free", self.slots.insert_if_free(host_email, span))
            .await
    }

    pub async fn remove(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError> {
        self.bounded("remove", self.slots.remove(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    /// Fails the first `failures` calls of every operation, optionally hanging instead.
    struct FlakyStore {
        failures: u32,
        hang: bool,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, hang: bool) -> Self {
            Self {
                failures,
                hang,
                calls: AtomicU32::new(0),
            }
        }

        async fn attempt(&self) -> Result<(), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.hang {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                return Err(StoreError::Unavailable("flaky".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SlotStore for FlakyStore {
        async fn query_overlap(&self, _: &str, _: Span) -> Result<Vec<BookedSlot>, StoreError> {
            self.attempt().await.map(|()| Vec::new())
        }
        async fn insert_if_free(&self, host_email: &str, span: Span) -> Result<BookedSlot, StoreError> {
            self.attempt().await.map(|()| BookedSlot {
                id: 1,
                host_email: host_email.to_string(),
                span,
            })
        }
        async fn remove(&self, _: SlotId) -> Result<Option<BookedSlot>, StoreError> {
            self.attempt().await.map(|()| None)
        }
        async fn get(&self, _: SlotId) -> Result<Option<BookedSlot>, StoreError> {
            self.attempt().await.map(|()| None)
        }
        async fn slots_for_host(&self, _: &str, _: Option<Span>) -> Result<Vec<BookedSlot>, StoreError> {
            self.attempt().await.map(|()| Vec::new())
        }
    }

    #[async_trait]
    impl TokenSource for FlakyStore {
        async fn schedule_token(&self, _: &str) -> Result<Option<String>, StoreError> {
            self.attempt().await.map(|()| None)
        }
        async fn api_tokens(&self) -> Result<Vec<String>, StoreError> {
            self.attempt().await.map(|()| Vec::new())
        }
    }

    fn gateway(store: Arc<FlakyStore>, read_retries: u32) -> StoreGateway {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(100),
            read_retries,
            backoff: Duration::from_millis(1),
        };
        StoreGateway::new(store.clone(), store, policy)
    }

    #[tokio::test]
    async fn reads_retry_until_success() {
        let store = Arc::new(FlakyStore::new(2, false));
        let gw = gateway(store.clone(), 3);
        assert!(gw.query_overlap("h", Span::new(0, 1)).await.unwrap().is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reads_give_up_after_bound() {
        let store = Arc::new(FlakyStore::new(10, false));
        let gw = gateway(store.clone(), 2);
        let err = gw.api_tokens().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn writes_never_retry() {
        let store = Arc::new(FlakyStore::new(1, false));
        let gw = gateway(store.clone(), 5);
        let err = gw.insert_if_free("h", Span::new(0, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out() {
        let store = Arc::new(FlakyStore::new(1, true));
        let gw = gateway(store.clone(), 0);
        let err = gw.remove(7).await.unwrap_err();
        match err {
            StoreError::Unavailable(msg) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_read_recovers_on_retry() {
        let store = Arc::new(FlakyStore::new(1, true));
        let gw = gateway(store.clone(), 1);
        assert_eq!(gw.schedule_token("h").await.unwrap(), None);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }
}
