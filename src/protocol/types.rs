//! Request and snapshot types exchanged with producers, workers, and dashboards.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::limits::BucketKey;

/// A request to admit work against a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub bucket: BucketKey,
    pub class: String,
    /// Tokens to take; defaults to 1
    #[serde(default = "default_tokens")]
    pub tokens: u32,
    /// Upper bound on the store round trip; `None` or zero uses the configured default
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Unique per attempt, so a retried call is not consumed twice
    #[serde(default)]
    pub attempt_id: Option<Uuid>,
}

fn default_tokens() -> u32 {
    1
}

impl AcquireRequest {
    pub fn new(bucket: impl Into<BucketKey>, class: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            class: class.into(),
            tokens: default_tokens(),
            timeout: None,
            attempt_id: None,
        }
    }

    pub fn tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn attempt_id(mut self, attempt_id: Uuid) -> Self {
        self.attempt_id = Some(attempt_id);
        self
    }

    /// Tag the request with a fresh attempt id.
    pub fn with_new_attempt(self) -> Self {
        self.attempt_id(Uuid::new_v4())
    }
}

/// Read-only view of a bucket for observability collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub bucket: BucketKey,
    /// Configuration version the snapshot was computed against
    pub version: u64,
    /// The bucket uses the default template
    pub defaulted: bool,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
    /// Tokens available now, after refill
    pub current_tokens: f64,
    /// Estimated demand exceeds the window's supply
    pub contended: bool,
    pub classes: Vec<ClassStatus>,
}

/// Per-class detail in a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassStatus {
    pub name: String,
    pub weight: u32,
    pub min_guaranteed_fraction: Option<f64>,
    /// Tokens the class may be admitted in the current window
    pub allowance: f64,
    pub admitted_in_window: f64,
    /// Carried admission credit; `None` until the class is first gated
    pub credit: Option<f64>,
    pub estimated_demand: f64,
    /// Decayed downstream throttle reports
    pub pressure: f64,
    pub suggested_concurrency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_defaults() {
        let request = AcquireRequest::new("t/q", "bulk");
        assert_eq!(request.tokens, 1);
        assert!(request.timeout.is_none());
        assert!(request.attempt_id.is_none());

        let request = request.tokens(3).timeout(Duration::from_millis(50)).with_new_attempt();
        assert_eq!(request.tokens, 3);
        assert_eq!(request.timeout, Some(Duration::from_millis(50)));
        assert!(request.attempt_id.is_some());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: AcquireRequest =
            serde_json::from_str(r#"{"bucket": "t/q", "class": "critical"}"#).unwrap();
        assert_eq!(request.bucket, BucketKey::new("t/q"));
        assert_eq!(request.tokens, 1);
    }
}
