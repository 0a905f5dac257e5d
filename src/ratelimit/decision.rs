//! Admission results returned to producers and workers.

use serde::Serialize;
use std::time::Duration;

/// The decision for one acquisition request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// The request may proceed.
    Granted {
        /// Fewest tokens left across the buckets checked
        tokens_remaining: f64,
        /// Admitted under the fail-open policy without consulting the store
        degraded: bool,
    },
    /// The request must wait; nothing was consumed.
    Throttled {
        /// How long until a retry could succeed
        retry_after: Duration,
        limited_by: LimitedBy,
    },
    /// The request cannot be admitted as asked.
    Rejected { reason: RejectReason },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, AcquireOutcome::Throttled { .. })
    }

    /// Retry hint; zero unless throttled.
    pub fn retry_after(&self) -> Duration {
        match self {
            AcquireOutcome::Throttled { retry_after, .. } => *retry_after,
            _ => Duration::ZERO,
        }
    }
}

/// Which limit throttled a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitedBy {
    /// The bucket is out of tokens.
    Bucket,
    /// The global limit is out of tokens.
    Global,
    /// The class has used its allowance for the current window.
    ClassAllowance,
}

/// Why a request was rejected outright.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// The request asked for zero tokens.
    InvalidRequest { detail: String },
    /// The bucket defines classes and this is not one of them.
    UnknownClass { class: String },
    /// More tokens were requested than the bucket can ever hold.
    ExceedsCapacity { requested: f64, capacity: f64 },
    /// The bucket does not refill, so waiting cannot help.
    NoRefill,
    /// The store failed and the bucket fails closed.
    StoreUnavailable { detail: String },
    /// The store timed out and the bucket fails closed.
    StoreTimeout { timeout: Duration },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidRequest { detail } => write!(f, "invalid request: {}", detail),
            RejectReason::UnknownClass { class } => write!(f, "unknown priority class {}", class),
            RejectReason::ExceedsCapacity {
                requested,
                capacity,
            } => write!(f, "requested {} tokens exceeds capacity {}", requested, capacity),
            RejectReason::NoRefill => write!(f, "bucket is exhausted and does not refill"),
            RejectReason::StoreUnavailable { detail } => write!(f, "store unavailable: {}", detail),
            RejectReason::StoreTimeout { timeout } => write!(f, "store timed out after {:?}", timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_only_for_throttled() {
        let throttled = AcquireOutcome::Throttled {
            retry_after: Duration::from_millis(300),
            limited_by: LimitedBy::Bucket,
        };
        assert_eq!(throttled.retry_after(), Duration::from_millis(300));
        assert!(throttled.is_throttled());

        let granted = AcquireOutcome::Granted {
            tokens_remaining: 1.0,
            degraded: false,
        };
        assert_eq!(granted.retry_after(), Duration::ZERO);
        assert!(granted.is_granted());
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let rejected = AcquireOutcome::Rejected {
            reason: RejectReason::UnknownClass {
                class: "vip".to_string(),
            },
        };
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"]["reason"], "unknown_class");
    }
}
