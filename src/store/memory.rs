//! In-process store with the same atomicity contract as a scripted remote store.
//!
//! All records live behind one mutex, so an evaluation spanning several
//! buckets (e.g. a bucket and the global limit) is applied as a unit.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ratelimit::{
    evaluate_checks, BucketLimits, BucketRecord, EvalMode, EvalOutcome, EvalRequest,
};

use super::{BucketStore, StoreError, StoreKey};

/// How many attempt ids are remembered for deduplication.
const ATTEMPT_HISTORY: usize = 4096;

#[derive(Debug, Default)]
struct StoreState {
    buckets: HashMap<String, BucketRecord>,
    documents: HashMap<String, String>,
    attempts: HashMap<Uuid, EvalOutcome>,
    attempt_order: VecDeque<Uuid>,
}

impl StoreState {
    fn remember_attempt(&mut self, attempt_id: Uuid, outcome: &EvalOutcome) {
        if self.attempts.insert(attempt_id, outcome.clone()).is_none() {
            self.attempt_order.push_back(attempt_id);
        }
        while self.attempt_order.len() > ATTEMPT_HISTORY {
            if let Some(oldest) = self.attempt_order.pop_front() {
                self.attempts.remove(&oldest);
            }
        }
    }
}

/// Injected failures, for exercising degraded paths.
#[derive(Debug, Clone, Default)]
struct Faults {
    unavailable: Option<String>,
    latency: Duration,
}

/// An in-memory [`BucketStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    faults: RwLock<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `reason`, or clear the fault with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.faults.write().unavailable = reason.map(str::to_string);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.write().latency = latency;
    }

    /// Number of bucket records held.
    pub fn bucket_count(&self) -> usize {
        self.state.lock().buckets.len()
    }

    /// Drop bucket records untouched for longer than `idle`.
    ///
    /// This is the store's retention policy; the evaluator never deletes
    /// buckets on its own.
    pub fn evict_idle(&self, now_ms: u64, idle: Duration) -> usize {
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.state.lock();
        let before = state.buckets.len();
        state
            .buckets
            .retain(|_, record| now_ms.saturating_sub(record.last_seen_ms) <= idle_ms);
        let evicted = before - state.buckets.len();
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted idle bucket records");
        }
        evicted
    }

    async fn check_faults(&self) -> Result<(), StoreError> {
        let faults = self.faults.read().clone();
        if !faults.latency.is_zero() {
            tokio::time::sleep(faults.latency).await;
        }
        match faults.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BucketStore for InMemoryStore {
    async fn eval_and_consume(&self, request: &EvalRequest) -> Result<EvalOutcome, StoreError> {
        self.check_faults().await?;

        let mut state = self.state.lock();

        if let Some(attempt_id) = request.attempt_id {
            if let Some(previous) = state.attempts.get(&attempt_id) {
                trace!(attempt_id = %attempt_id, "Returning recorded outcome for repeated attempt");
                return Ok(previous.clone());
            }
        }

        let keys: Vec<String> = request
            .checks
            .iter()
            .map(|check| check.key.to_store_key())
            .collect();
        let records = keys
            .iter()
            .map(|key| state.buckets.get(key).cloned())
            .collect();

        let (outcome, updated) = evaluate_checks(request, records);

        if request.mode == EvalMode::Consume {
            for (key, record) in keys.into_iter().zip(updated) {
                state.buckets.insert(key, record);
            }
            if let Some(attempt_id) = request.attempt_id {
                state.remember_attempt(attempt_id, &outcome);
            }
        }

        Ok(outcome)
    }

    async fn inspect(&self, key: &StoreKey) -> Result<Option<BucketRecord>, StoreError> {
        self.check_faults().await?;
        Ok(self.state.lock().buckets.get(&key.to_store_key()).cloned())
    }

    async fn refill(
        &self,
        key: &StoreKey,
        limits: BucketLimits,
        tokens: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError> {
        self.check_faults().await?;

        let mut state = self.state.lock();
        let record = state
            .buckets
            .entry(key.to_store_key())
            .or_insert_with(|| BucketRecord::new(limits, now_ms));
        record.state.reconfigure(limits.capacity, limits.refill_rate);
        record.state.refill(now_ms);
        record.last_seen_ms = record.last_seen_ms.max(now_ms);
        Ok(record.state.add_tokens(tokens))
    }

    async fn reset(&self, key: &StoreKey) -> Result<bool, StoreError> {
        self.check_faults().await?;
        Ok(self.state.lock().buckets.remove(&key.to_store_key()).is_some())
    }

    async fn load_document(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        self.check_faults().await?;
        Ok(self.state.lock().documents.get(&key.to_store_key()).cloned())
    }

    async fn swap_document(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        document: &str,
    ) -> Result<bool, StoreError> {
        self.check_faults().await?;

        let mut state = self.state.lock();
        let store_key = key.to_store_key();
        if state.documents.get(&store_key).map(String::as_str) != expected {
            return Ok(false);
        }
        state.documents.insert(store_key, document.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::BucketKey;
    use crate::ratelimit::BucketCheck;
    use std::sync::Arc;

    fn key() -> StoreKey {
        StoreKey::bucket("test", &BucketKey::new("t/q"))
    }

    fn limits() -> BucketLimits {
        BucketLimits {
            capacity: 5.0,
            refill_rate: 0.0,
        }
    }

    fn request(mode: EvalMode, attempt_id: Option<Uuid>) -> EvalRequest {
        EvalRequest {
            now_ms: 1_000,
            requested: 1.0,
            mode,
            attempt_id,
            checks: vec![BucketCheck {
                key: key(),
                limits: limits(),
                gate: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_consume_persists_and_dry_run_does_not() {
        let store = InMemoryStore::new();

        let outcome = store.eval_and_consume(&request(EvalMode::DryRun, None)).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(store.bucket_count(), 0);

        store.eval_and_consume(&request(EvalMode::Consume, None)).await.unwrap();
        let record = store.inspect(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.tokens, 4.0);
    }

    #[tokio::test]
    async fn test_repeated_attempt_is_not_consumed_twice() {
        let store = InMemoryStore::new();
        let attempt = Some(Uuid::new_v4());

        let first = store.eval_and_consume(&request(EvalMode::Consume, attempt)).await.unwrap();
        let second = store.eval_and_consume(&request(EvalMode::Consume, attempt)).await.unwrap();
        assert_eq!(first, second);

        let record = store.inspect(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.tokens, 4.0);
    }

    #[tokio::test]
    async fn test_concurrent_evaluations_conserve_tokens() {
        let store = Arc::new(InMemoryStore::new());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .eval_and_consume(&request(EvalMode::Consume, None))
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let granted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_refill_and_reset() {
        let store = InMemoryStore::new();
        store.eval_and_consume(&request(EvalMode::Consume, None)).await.unwrap();

        let tokens = store.refill(&key(), limits(), 10.0, 1_000).await.unwrap();
        assert_eq!(tokens, 5.0);

        assert!(store.reset(&key()).await.unwrap());
        assert!(!store.reset(&key()).await.unwrap());
        assert!(store.inspect(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_swap_document_compares_content() {
        let store = InMemoryStore::new();
        let config = StoreKey::config("test");

        assert!(store.swap_document(&config, None, "v1").await.unwrap());
        assert!(!store.swap_document(&config, None, "v2").await.unwrap());
        assert!(store.swap_document(&config, Some("v1"), "v2").await.unwrap());
        assert_eq!(store.load_document(&config).await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_unavailable_fault() {
        let store = InMemoryStore::new();
        store.set_unavailable(Some("connection refused"));

        let result = store.eval_and_consume(&request(EvalMode::Consume, None)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_unavailable(None);
        assert!(store.eval_and_consume(&request(EvalMode::Consume, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = InMemoryStore::new();
        store.eval_and_consume(&request(EvalMode::Consume, None)).await.unwrap();

        assert_eq!(store.evict_idle(2_000, Duration::from_secs(10)), 0);
        assert_eq!(store.evict_idle(20_000, Duration::from_secs(10)), 1);
        assert_eq!(store.bucket_count(), 0);
    }
}
