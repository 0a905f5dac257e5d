//! Bucket state store adapter.
//!
//! The store owns the authoritative bucket records. Its one essential
//! operation, [`BucketStore::eval_and_consume`], must run
//! [`evaluate_checks`](crate::ratelimit::evaluate_checks) against the named
//! records with no interleaving from other clients on the same keys.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::error::{FairgateError, Result};
use crate::limits::BucketKey;
use crate::ratelimit::{BucketLimits, BucketRecord, EvalOutcome, EvalRequest};

pub use memory::InMemoryStore;

/// Record name holding the serialized limit configuration.
const CONFIG_RECORD: &str = "config";
/// Record name holding the global bucket.
const GLOBAL_RECORD: &str = "global";

/// Errors raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
}

/// Key identifying a record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    /// Deployment-wide prefix
    pub scope: String,
    /// Bucket key or reserved record name
    pub name: String,
}

impl StoreKey {
    /// Key for a bucket record.
    pub fn bucket(scope: &str, bucket: &BucketKey) -> Self {
        Self {
            scope: scope.to_string(),
            name: bucket.as_str().to_string(),
        }
    }

    /// Key for the global bucket record.
    pub fn global(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            name: GLOBAL_RECORD.to_string(),
        }
    }

    /// Key for the limit configuration document.
    pub fn config(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            name: CONFIG_RECORD.to_string(),
        }
    }

    /// Format: "{scope}:{name}"
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// A store with atomic scripted execution.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically evaluate a request against every bucket it names.
    ///
    /// In consume mode the resulting records are written back before any
    /// other evaluation on the same keys can observe them; in dry-run mode
    /// nothing is written. A request with an attempt id already seen returns
    /// the outcome recorded for that attempt.
    async fn eval_and_consume(&self, request: &EvalRequest) -> std::result::Result<EvalOutcome, StoreError>;

    /// Read a bucket record without modifying it.
    async fn inspect(&self, key: &StoreKey) -> std::result::Result<Option<BucketRecord>, StoreError>;

    /// Add tokens to a bucket, creating it full if missing. Returns the new count.
    async fn refill(
        &self,
        key: &StoreKey,
        limits: BucketLimits,
        tokens: f64,
        now_ms: u64,
    ) -> std::result::Result<f64, StoreError>;

    /// Delete a bucket record. Returns whether it existed.
    async fn reset(&self, key: &StoreKey) -> std::result::Result<bool, StoreError>;

    /// Read a whole document.
    async fn load_document(&self, key: &StoreKey) -> std::result::Result<Option<String>, StoreError>;

    /// Replace a document only if its current content equals `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn swap_document(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        document: &str,
    ) -> std::result::Result<bool, StoreError>;
}

/// Run a store operation with an upper bound on its duration.
pub async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(FairgateError::from),
        Err(_) => Err(FairgateError::StoreTimeout(timeout)),
    }
}
