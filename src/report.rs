//! Reporting interface for observability collaborators.
//!
//! Non-fatal conditions noticed while evaluating requests are pushed through
//! an [`EventReporter`] instead of being returned to the caller of `acquire`.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use crate::limits::BucketKey;

/// A non-fatal configuration problem detected during evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigurationWarning {
    /// Every contending class under the bucket has weight zero; all were
    /// treated as weight 1.
    ZeroWeightSum { bucket: BucketKey },
}

impl std::fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationWarning::ZeroWeightSum { bucket } => write!(
                f,
                "bucket {} has contending classes whose weights sum to zero; using equal weights",
                bucket
            ),
        }
    }
}

/// Sink for events an operator should hear about.
pub trait EventReporter: Send + Sync {
    /// A configuration warning was raised while evaluating a request.
    fn configuration_warning(&self, warning: &ConfigurationWarning);

    /// A request was admitted without consulting the store because the
    /// bucket is configured to fail open.
    fn fail_open_admission(&self, bucket: &BucketKey, class: &str, cause: &str);
}

/// Reporter that writes events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn configuration_warning(&self, warning: &ConfigurationWarning) {
        warn!(warning = %warning, "Configuration warning");
    }

    fn fail_open_admission(&self, bucket: &BucketKey, class: &str, cause: &str) {
        error!(
            bucket = %bucket,
            class = %class,
            cause = %cause,
            "Store unavailable, admitting request under fail-open policy"
        );
    }
}

/// Reporter that keeps every event in memory.
///
/// Useful for tests and for dashboards that poll for recent warnings.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    warnings: Mutex<Vec<ConfigurationWarning>>,
    fail_open: Mutex<Vec<(BucketKey, String)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> Vec<ConfigurationWarning> {
        self.warnings.lock().clone()
    }

    /// Fail-open admissions recorded so far, as (bucket, class).
    pub fn fail_open_admissions(&self) -> Vec<(BucketKey, String)> {
        self.fail_open.lock().clone()
    }
}

impl EventReporter for RecordingReporter {
    fn configuration_warning(&self, warning: &ConfigurationWarning) {
        TracingReporter.configuration_warning(warning);
        self.warnings.lock().push(warning.clone());
    }

    fn fail_open_admission(&self, bucket: &BucketKey, class: &str, cause: &str) {
        TracingReporter.fail_open_admission(bucket, class, cause);
        self.fail_open.lock().push((bucket.clone(), class.to_string()));
    }
}
