//! Admission controller: the operations producers, workers, dashboards, and
//! administrators call.
//!
//! Every decision comes from one store round trip. Nothing here blocks or
//! queues; a throttled caller gets a retry hint and decides how to wait.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FairgateError, Result};
use crate::limits::{BucketDefinition, BucketKey, BucketSnapshot, FailurePolicy, LimitConfiguration, LimitRegistry};
use crate::ratelimit::{
    suggested_concurrency, AcquireOutcome, Admission, BackpressureHint, BucketLimits, BucketRecord,
    EvalMode, Pipeline, RejectReason, ThrottleSignals,
};
use crate::report::{EventReporter, TracingReporter};
use crate::store::{with_timeout, BucketStore, StoreKey};

use super::types::{AcquireRequest, ClassStatus, StatusSnapshot};

/// Default half-life of downstream throttle reports.
const DEFAULT_THROTTLE_HALF_LIFE: Duration = Duration::from_secs(5);

/// Evaluates admissions against a shared store under the registry's limits.
pub struct AdmissionController<S: BucketStore + ?Sized> {
    registry: Arc<LimitRegistry<S>>,
    reporter: Arc<dyn EventReporter>,
    signals: ThrottleSignals,
}

impl<S: BucketStore + ?Sized> AdmissionController<S> {
    pub fn new(registry: Arc<LimitRegistry<S>>) -> Self {
        Self {
            registry,
            reporter: Arc::new(TracingReporter),
            signals: ThrottleSignals::new(DEFAULT_THROTTLE_HALF_LIFE),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn EventReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_throttle_half_life(mut self, half_life: Duration) -> Self {
        self.signals = ThrottleSignals::new(half_life);
        self
    }

    pub fn registry(&self) -> &Arc<LimitRegistry<S>> {
        &self.registry
    }

    /// Decide whether `request` may proceed, consuming tokens if it may.
    ///
    /// Store failures are resolved by the bucket's failure policy and never
    /// surface as errors.
    pub async fn acquire(&self, request: &AcquireRequest) -> AcquireOutcome {
        let config = self.registry.snapshot();
        let timeout = request
            .timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| self.registry.operation_timeout());

        let pipeline = Pipeline {
            scope: self.registry.scope(),
            scheduler: self.registry.scheduler(),
            config: &config,
            timeout,
        };
        let admission = Admission {
            bucket: &request.bucket,
            class: &request.class,
            tokens: request.tokens,
            mode: EvalMode::Consume,
            attempt_id: request.attempt_id,
        };
        let now = self.registry.clock().now_millis();

        match pipeline.run(self.registry.store().as_ref(), &admission, now).await {
            Ok(result) => {
                for warning in &result.warnings {
                    self.reporter.configuration_warning(warning);
                }
                result.outcome
            }
            Err(err) if err.is_store_failure() => self.degrade(&config, request, err),
            Err(err) => {
                warn!(bucket = %request.bucket, class = %request.class, error = %err, "Admission failed");
                AcquireOutcome::Rejected {
                    reason: RejectReason::InvalidRequest {
                        detail: err.to_string(),
                    },
                }
            }
        }
    }

    /// Project the decision `acquire` would make, without side effects.
    pub async fn dry_run(&self, bucket: &BucketKey, class: &str, tokens: u32) -> Result<AcquireOutcome> {
        self.registry.dry_run(bucket, class, tokens).await
    }

    /// Record that a downstream service throttled work for this class, and
    /// return the updated concurrency hint.
    ///
    /// Reports for a class the bucket does not define are not recorded.
    pub fn report_observed_throttle(&self, bucket: &BucketKey, class: &str) -> BackpressureHint {
        let config = self.registry.snapshot();
        let (definition, _) = config.definition_for(bucket);
        if !definition.classes.is_empty() && definition.class(class).is_none() {
            debug!(bucket = %bucket, class = %class, "Ignoring throttle report for undefined class");
            return self.backpressure_hint(bucket, class);
        }

        let now = self.registry.clock().now_millis();
        let pressure = self.signals.record(bucket, class, now);
        self.hint(bucket, class, pressure)
    }

    /// The current concurrency hint, without recording a report.
    pub fn backpressure_hint(&self, bucket: &BucketKey, class: &str) -> BackpressureHint {
        let now = self.registry.clock().now_millis();
        let pressure = self.signals.pressure(bucket, class, now);
        self.hint(bucket, class, pressure)
    }

    /// Read-only view of a bucket's tokens and class allowances.
    pub async fn status_snapshot(&self, bucket: &BucketKey) -> Result<StatusSnapshot> {
        let config = self.registry.snapshot();
        let (definition, defaulted) = config.definition_for(bucket);
        let scheduler = self.registry.scheduler();
        let now = self.registry.clock().now_millis();
        let limits = limits_of(definition);

        let key = StoreKey::bucket(self.registry.scope(), bucket);
        let stored = with_timeout(
            self.registry.operation_timeout(),
            self.registry.store().inspect(&key),
        )
        .await?;

        // Project the record to `now` locally; the store is not written.
        let mut record = stored.unwrap_or_else(|| BucketRecord::new(limits, now));
        record.state.reconfigure(limits.capacity, limits.refill_rate);
        record.state.refill(now);
        record.ledger.roll(now, scheduler.window_ms());

        let supply = scheduler.supply(limits.capacity, limits.refill_rate);
        let plan = scheduler.plan(&definition.classes, &record.ledger, supply, now);

        let classes = definition
            .classes
            .iter()
            .map(|class| {
                let hint = self.backpressure_hint(bucket, &class.name);
                ClassStatus {
                    name: class.name.clone(),
                    weight: class.weight,
                    min_guaranteed_fraction: class.min_guaranteed_fraction,
                    allowance: plan.allowance(&class.name).unwrap_or(0.0),
                    admitted_in_window: record.ledger.admitted(&class.name),
                    credit: record.ledger.credit(&class.name),
                    estimated_demand: record
                        .ledger
                        .estimated_demand(&class.name, now, scheduler.window_ms()),
                    pressure: hint.pressure,
                    suggested_concurrency: hint.suggested_concurrency,
                }
            })
            .collect();

        Ok(StatusSnapshot {
            bucket: bucket.clone(),
            version: config.version,
            defaulted,
            capacity: definition.capacity,
            refill_rate_per_second: definition.refill_rate_per_second,
            current_tokens: record.state.tokens,
            contended: plan.contended,
            classes,
        })
    }

    /// The configuration governing `bucket`.
    pub fn get_limits(&self, bucket: &BucketKey) -> BucketSnapshot {
        self.registry.get(bucket)
    }

    /// Publish a new definition for `bucket`. Returns the new version.
    pub async fn update_limits(
        &self,
        bucket: &BucketKey,
        definition: BucketDefinition,
        actor: &str,
    ) -> Result<u64> {
        Ok(self.registry.update(bucket, definition, actor).await?.version)
    }

    /// Remove `bucket`'s definition. Returns the new version.
    pub async fn remove_limits(&self, bucket: &BucketKey, actor: &str) -> Result<u64> {
        Ok(self.registry.remove(bucket, actor).await?.version)
    }

    /// Add tokens to a bucket, capped at its capacity. Returns the new count.
    pub async fn refill(&self, bucket: &BucketKey, tokens: u32, actor: &str) -> Result<f64> {
        let config = self.registry.snapshot();
        let (definition, _) = config.definition_for(bucket);
        let key = StoreKey::bucket(self.registry.scope(), bucket);
        let now = self.registry.clock().now_millis();

        let available = with_timeout(
            self.registry.operation_timeout(),
            self.registry
                .store()
                .refill(&key, limits_of(definition), tokens as f64, now),
        )
        .await?;

        info!(actor = %actor, bucket = %bucket, tokens = tokens, available = available, "Refilled bucket");
        Ok(available)
    }

    /// Delete a bucket's state so it is recreated full. Returns whether it existed.
    pub async fn reset(&self, bucket: &BucketKey, actor: &str) -> Result<bool> {
        let key = StoreKey::bucket(self.registry.scope(), bucket);
        let existed = with_timeout(self.registry.operation_timeout(), self.registry.store().reset(&key)).await?;

        info!(actor = %actor, bucket = %bucket, existed = existed, "Reset bucket");
        Ok(existed)
    }

    fn hint(&self, bucket: &BucketKey, class: &str, pressure: f64) -> BackpressureHint {
        let config = self.registry.snapshot();
        let (definition, _) = config.definition_for(bucket);
        BackpressureHint {
            pressure,
            suggested_concurrency: suggested_concurrency(self.nominal_rate(definition, class), pressure),
        }
    }

    /// Per-second rate `class` would get if every class were saturating the bucket.
    fn nominal_rate(&self, definition: &BucketDefinition, class: &str) -> f64 {
        let scheduler = self.registry.scheduler();
        let windows_per_second = 1000.0 / scheduler.window_ms() as f64;
        let supply = scheduler.supply(definition.capacity, definition.refill_rate_per_second);

        if definition.classes.is_empty() {
            return supply * windows_per_second;
        }
        scheduler
            .nominal(&definition.classes, supply)
            .allowance(class)
            .unwrap_or(0.0)
            * windows_per_second
    }

    fn degrade(
        &self,
        config: &LimitConfiguration,
        request: &AcquireRequest,
        err: FairgateError,
    ) -> AcquireOutcome {
        let (definition, _) = config.definition_for(&request.bucket);
        match definition.failure_policy {
            FailurePolicy::FailOpen => {
                self.reporter
                    .fail_open_admission(&request.bucket, &request.class, &err.to_string());
                AcquireOutcome::Granted {
                    tokens_remaining: 0.0,
                    degraded: true,
                }
            }
            FailurePolicy::FailClosed => {
                warn!(
                    bucket = %request.bucket,
                    class = %request.class,
                    error = %err,
                    "Store unavailable, rejecting request under fail-closed policy"
                );
                let reason = match err {
                    FairgateError::StoreTimeout(timeout) => RejectReason::StoreTimeout { timeout },
                    other => RejectReason::StoreUnavailable {
                        detail: other.to_string(),
                    },
                };
                AcquireOutcome::Rejected { reason }
            }
        }
    }
}

fn limits_of(definition: &BucketDefinition) -> BucketLimits {
    BucketLimits {
        capacity: definition.capacity,
        refill_rate: definition.refill_rate_per_second,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limits::PriorityClass;
    use crate::ratelimit::{FairnessScheduler, LimitedBy};
    use crate::report::{ConfigurationWarning, RecordingReporter};
    use crate::store::InMemoryStore;
    use std::collections::HashMap;
    use uuid::Uuid;

    struct Harness {
        controller: Arc<AdmissionController<InMemoryStore>>,
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness(config: LimitConfiguration) -> Harness {
        harness_with_scheduler(config, FairnessScheduler::default())
    }

    fn harness_with_scheduler(config: LimitConfiguration, scheduler: FairnessScheduler) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let reporter = Arc::new(RecordingReporter::new());
        let registry = LimitRegistry::new(store.clone(), "test", config)
            .with_scheduler(scheduler)
            .with_clock(clock.clone());
        let controller = AdmissionController::new(Arc::new(registry)).with_reporter(reporter.clone());
        Harness {
            controller: Arc::new(controller),
            store,
            clock,
            reporter,
        }
    }

    fn mixed_bucket() -> BucketDefinition {
        BucketDefinition::new(9.0, 9.0)
            .with_class(PriorityClass::new("critical", 8))
            .with_class(PriorityClass::new("bulk", 1))
    }

    #[tokio::test]
    async fn test_capacity_ten_refill_one_scenario() {
        let h = harness(LimitConfiguration::new().with_bucket("t/q", BucketDefinition::new(10.0, 1.0)));
        let request = AcquireRequest::new("t/q", "any");

        for _ in 0..10 {
            assert!(h.controller.acquire(&request).await.is_granted());
        }

        let outcome = h.controller.acquire(&request).await;
        assert_eq!(
            outcome,
            AcquireOutcome::Throttled {
                retry_after: Duration::from_secs(1),
                limited_by: LimitedBy::Bucket,
            }
        );

        h.clock.advance(Duration::from_secs(1));
        assert!(h.controller.acquire(&request).await.is_granted());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_conserve_tokens() {
        // The clock never moves, so nothing refills during the test.
        let h = harness(LimitConfiguration::new().with_bucket("t/q", BucketDefinition::new(5.0, 1.0)));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let controller = h.controller.clone();
                tokio::spawn(async move { controller.acquire(&AcquireRequest::new("t/q", "any")).await })
            })
            .collect();

        let outcomes: Vec<AcquireOutcome> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_granted()).count(), 5);
        assert_eq!(outcomes.iter().filter(|o| o.is_throttled()).count(), 15);
    }

    #[tokio::test]
    async fn test_weighted_classes_share_contended_bucket() {
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", mixed_bucket()));
        let mut admitted: HashMap<&str, u32> = HashMap::new();
        const WARM_UP: u64 = 5;
        const MEASURED: u64 = 60;

        for second in 0..WARM_UP + MEASURED {
            for step in 0..9u64 {
                h.clock.set(second * 1000 + step * 111);
                for class in ["critical", "bulk"] {
                    let outcome = h.controller.acquire(&AcquireRequest::new("t/mixed", class)).await;
                    if second >= WARM_UP && outcome.is_granted() {
                        *admitted.entry(class).or_default() += 1;
                    }
                }
            }
        }

        let critical = admitted["critical"] as f64 / MEASURED as f64;
        let bulk = admitted["bulk"] as f64 / MEASURED as f64;
        assert!((7.0..=8.5).contains(&critical), "critical rate {}", critical);
        assert!((0.5..=1.5).contains(&bulk), "bulk rate {}", bulk);
    }

    #[tokio::test]
    async fn test_guaranteed_floor_holds_against_heavy_weight() {
        let definition = BucketDefinition::new(10.0, 10.0)
            .with_class(PriorityClass::new("a", 1).with_floor(0.3))
            .with_class(PriorityClass::new("b", 100));
        let h = harness(LimitConfiguration::new().with_bucket("t/floor", definition));
        let mut admitted_a = 0u32;
        const WARM_UP: u64 = 5;
        const MEASURED: u64 = 60;

        for second in 0..WARM_UP + MEASURED {
            for step in 0..10u64 {
                h.clock.set(second * 1000 + step * 100);
                h.controller.acquire(&AcquireRequest::new("t/floor", "b")).await;
                let outcome = h.controller.acquire(&AcquireRequest::new("t/floor", "a")).await;
                if second >= WARM_UP && outcome.is_granted() {
                    admitted_a += 1;
                }
            }
        }

        let rate = admitted_a as f64 / MEASURED as f64;
        assert!(rate >= 2.9, "floor class rate {}", rate);
    }

    #[tokio::test]
    async fn test_class_allowance_throttle_waits_for_credit() {
        // Plenty of tokens, so only the class allowance can refuse.
        let definition = BucketDefinition::new(100.0, 9.0)
            .with_class(PriorityClass::new("critical", 8))
            .with_class(PriorityClass::new("bulk", 1));
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", definition));
        h.clock.set(10_000);

        for _ in 0..9 {
            assert!(h.controller.acquire(&AcquireRequest::new("t/mixed", "critical")).await.is_granted());
        }
        // Demand now exceeds the window's supply of 9; bulk's allowance is 1
        // and it starts with two tokens of credit.
        for _ in 0..2 {
            assert!(h.controller.acquire(&AcquireRequest::new("t/mixed", "bulk")).await.is_granted());
        }
        let outcome = h.controller.acquire(&AcquireRequest::new("t/mixed", "bulk")).await;
        assert_eq!(
            outcome,
            AcquireOutcome::Throttled {
                retry_after: Duration::from_secs(1),
                limited_by: LimitedBy::ClassAllowance,
            }
        );

        h.clock.set(11_000);
        assert!(h.controller.acquire(&AcquireRequest::new("t/mixed", "bulk")).await.is_granted());
    }

    #[tokio::test]
    async fn test_fractional_refill_admits_classed_bucket() {
        let definition = BucketDefinition::new(10.0, 0.5).with_class(PriorityClass::new("a", 1));
        let h = harness(LimitConfiguration::new().with_bucket("t/slow", definition));
        let mut outcomes = Vec::new();

        for second in 0..60u64 {
            h.clock.set(10_000 + second * 1000);
            outcomes.push(h.controller.acquire(&AcquireRequest::new("t/slow", "a")).await);
        }

        assert!(outcomes[0].is_granted());
        assert_eq!(
            outcomes[3],
            AcquireOutcome::Throttled {
                retry_after: Duration::from_secs(1),
                limited_by: LimitedBy::ClassAllowance,
            }
        );
        assert!(outcomes[4].is_granted());
        let granted = outcomes.iter().filter(|o| o.is_granted()).count();
        assert!((29..=33).contains(&granted), "granted {}", granted);
    }

    #[tokio::test]
    async fn test_short_window_keeps_bucket_saturated() {
        // Each 100ms window supplies 0.9 tokens, split 0.8 and 0.1.
        let h = harness_with_scheduler(
            LimitConfiguration::new().with_bucket("t/mixed", mixed_bucket()),
            FairnessScheduler::new(100),
        );
        let mut admitted: HashMap<&str, u32> = HashMap::new();

        for step in 0..600u64 {
            h.clock.set(10_000 + step * 100);
            for class in ["critical", "bulk"] {
                if h.controller.acquire(&AcquireRequest::new("t/mixed", class)).await.is_granted() {
                    *admitted.entry(class).or_default() += 1;
                }
            }
        }

        let critical = admitted["critical"];
        let bulk = admitted["bulk"];
        assert!((500..=560).contains(&(critical + bulk)), "granted {}", critical + bulk);
        assert!((40..=80).contains(&bulk), "bulk granted {}", bulk);
        assert!(critical > 5 * bulk);
    }

    #[tokio::test]
    async fn test_request_larger_than_class_allowance_is_paced() {
        let definition = BucketDefinition::new(100.0, 9.0)
            .with_class(PriorityClass::new("critical", 8))
            .with_class(PriorityClass::new("bulk", 1));
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", definition));
        let mut bulk = Vec::new();

        for second in 0..12u64 {
            let start = 10_000 + second * 1000;
            for step in 0..9u64 {
                h.clock.set(start + step * 111);
                h.controller.acquire(&AcquireRequest::new("t/mixed", "critical")).await;
            }
            h.clock.set(start + 500);
            bulk.push(h.controller.acquire(&AcquireRequest::new("t/mixed", "bulk").tokens(3)).await);
        }

        // Bulk's allowance is one token a second, so three tokens every three seconds.
        assert!(bulk[0].is_granted());
        assert_eq!(
            bulk[1],
            AcquireOutcome::Throttled {
                retry_after: Duration::from_secs(2),
                limited_by: LimitedBy::ClassAllowance,
            }
        );
        assert!(bulk[3].is_granted());
        assert_eq!(bulk.iter().filter(|o| o.is_granted()).count(), 4);
    }

    #[tokio::test]
    async fn test_unknown_class_is_rejected() {
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", mixed_bucket()));
        let outcome = h.controller.acquire(&AcquireRequest::new("t/mixed", "vip")).await;
        assert_eq!(
            outcome,
            AcquireOutcome::Rejected {
                reason: RejectReason::UnknownClass {
                    class: "vip".to_string()
                }
            }
        );
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates_state() {
        let h = harness(LimitConfiguration::new().with_bucket("t/q", BucketDefinition::new(10.0, 1.0)));
        let bucket = BucketKey::new("t/q");
        let key = StoreKey::bucket("test", &bucket);

        for _ in 0..3 {
            h.controller.acquire(&AcquireRequest::new("t/q", "any")).await;
        }
        let before = h.store.inspect(&key).await.unwrap().unwrap();

        h.clock.advance(Duration::from_millis(1500));
        for _ in 0..25 {
            let outcome = h.controller.dry_run(&bucket, "any", 1).await.unwrap();
            assert!(outcome.is_granted());
        }

        let after = h.store.inspect(&key).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(
            serde_json::to_vec(&before.state).unwrap(),
            serde_json::to_vec(&after.state).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fail_open_admits_and_reports() {
        let definition = BucketDefinition::new(10.0, 1.0).with_failure_policy(FailurePolicy::FailOpen);
        let h = harness(LimitConfiguration::new().with_bucket("t/open", definition));
        h.store.set_unavailable(Some("connection refused"));

        let outcome = h.controller.acquire(&AcquireRequest::new("t/open", "any")).await;
        assert_eq!(
            outcome,
            AcquireOutcome::Granted {
                tokens_remaining: 0.0,
                degraded: true
            }
        );
        assert_eq!(
            h.reporter.fail_open_admissions(),
            vec![(BucketKey::new("t/open"), "any".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fail_closed_rejects() {
        let h = harness(LimitConfiguration::new().with_bucket("t/closed", BucketDefinition::new(10.0, 1.0)));
        h.store.set_unavailable(Some("connection refused"));

        let outcome = h.controller.acquire(&AcquireRequest::new("t/closed", "any")).await;
        assert!(matches!(
            outcome,
            AcquireOutcome::Rejected {
                reason: RejectReason::StoreUnavailable { .. }
            }
        ));
        assert!(h.reporter.fail_open_admissions().is_empty());
    }

    #[tokio::test]
    async fn test_slow_store_is_a_timeout_not_a_throttle() {
        let h = harness(LimitConfiguration::new());
        h.store.set_latency(Duration::from_millis(200));

        let request = AcquireRequest::new("t/any", "any").timeout(Duration::from_millis(20));
        let outcome = h.controller.acquire(&request).await;
        assert_eq!(
            outcome,
            AcquireOutcome::Rejected {
                reason: RejectReason::StoreTimeout {
                    timeout: Duration::from_millis(20)
                }
            }
        );
    }

    #[tokio::test]
    async fn test_dry_run_returns_store_errors() {
        let h = harness(LimitConfiguration::new());
        h.store.set_unavailable(Some("connection refused"));

        let result = h.controller.dry_run(&BucketKey::new("t/q"), "any", 1).await;
        assert!(matches!(result, Err(FairgateError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_repeated_attempt_consumes_once() {
        let h = harness(LimitConfiguration::new().with_bucket("t/q", BucketDefinition::new(10.0, 1.0)));
        let request = AcquireRequest::new("t/q", "any").attempt_id(Uuid::new_v4());

        let first = h.controller.acquire(&request).await;
        let retried = h.controller.acquire(&request).await;
        assert_eq!(first, retried);

        let status = h.controller.status_snapshot(&BucketKey::new("t/q")).await.unwrap();
        assert_eq!(status.current_tokens, 9.0);
    }

    #[tokio::test]
    async fn test_zero_weight_warning_is_reported_not_returned() {
        let definition = BucketDefinition::new(4.0, 4.0)
            .with_class(PriorityClass::new("a", 0))
            .with_class(PriorityClass::new("b", 0));
        let h = harness(LimitConfiguration::new().with_bucket("t/zero", definition));

        for class in ["a", "b", "a", "b", "a", "b"] {
            h.controller.acquire(&AcquireRequest::new("t/zero", class)).await;
        }

        let warnings = h.reporter.warnings();
        assert!(!warnings.is_empty());
        assert_eq!(
            warnings[0],
            ConfigurationWarning::ZeroWeightSum {
                bucket: BucketKey::new("t/zero")
            }
        );
    }

    #[tokio::test]
    async fn test_observed_throttle_lowers_suggested_concurrency() {
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", mixed_bucket()));
        let bucket = BucketKey::new("t/mixed");

        assert_eq!(h.controller.backpressure_hint(&bucket, "critical").suggested_concurrency, 8);

        let hint = h.controller.report_observed_throttle(&bucket, "critical");
        assert_eq!(hint.pressure, 1.0);
        assert_eq!(hint.suggested_concurrency, 4);

        let hint = h.controller.report_observed_throttle(&bucket, "critical");
        assert_eq!(hint.suggested_concurrency, 2);

        // Reports decay back toward the nominal rate.
        h.clock.advance(Duration::from_secs(600));
        assert_eq!(h.controller.backpressure_hint(&bucket, "critical").suggested_concurrency, 8);
        assert_eq!(h.controller.report_observed_throttle(&bucket, "bulk").suggested_concurrency, 1);
    }

    #[tokio::test]
    async fn test_throttle_reports_for_undefined_class_are_ignored() {
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", mixed_bucket()));
        let bucket = BucketKey::new("t/mixed");

        for i in 0..100 {
            let hint = h.controller.report_observed_throttle(&bucket, &format!("class-{}", i));
            assert_eq!(hint.pressure, 0.0);
        }
        assert_eq!(h.controller.report_observed_throttle(&bucket, "bulk").pressure, 1.0);
        assert_eq!(h.controller.signals.len(), 1);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let h = harness(LimitConfiguration::new().with_bucket("t/mixed", mixed_bucket()));
        let bucket = BucketKey::new("t/mixed");

        for _ in 0..3 {
            h.controller.acquire(&AcquireRequest::new("t/mixed", "critical")).await;
        }

        let status = h.controller.status_snapshot(&bucket).await.unwrap();
        assert_eq!(status.version, 0);
        assert_eq!(status.capacity, 9.0);
        assert_eq!(status.current_tokens, 6.0);
        assert!(!status.contended);
        assert_eq!(status.classes.len(), 2);
        assert_eq!(status.classes[0].name, "critical");
        assert_eq!(status.classes[0].admitted_in_window, 3.0);
        assert!(status.classes[0].credit.is_some());
        assert_eq!(status.classes[1].credit, None);

        // A bucket never touched reports a full, defaulted bucket.
        let untouched = h.controller.status_snapshot(&BucketKey::new("t/other")).await.unwrap();
        assert!(untouched.defaulted);
        assert_eq!(untouched.current_tokens, 200.0);
        assert_eq!(h.store.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let h = harness(LimitConfiguration::new());
        let bucket = BucketKey::new("t/q");

        let version = h
            .controller
            .update_limits(&bucket, BucketDefinition::new(5.0, 0.0), "alice")
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(h.controller.get_limits(&bucket).definition.capacity, 5.0);

        for _ in 0..5 {
            assert!(h.controller.acquire(&AcquireRequest::new("t/q", "any")).await.is_granted());
        }
        assert_eq!(
            h.controller.acquire(&AcquireRequest::new("t/q", "any")).await,
            AcquireOutcome::Rejected {
                reason: RejectReason::NoRefill
            }
        );

        assert_eq!(h.controller.refill(&bucket, 2, "alice").await.unwrap(), 2.0);
        assert_eq!(h.controller.refill(&bucket, 100, "alice").await.unwrap(), 5.0);

        assert!(h.controller.reset(&bucket, "alice").await.unwrap());
        assert_eq!(h.store.bucket_count(), 0);

        let version = h.controller.remove_limits(&bucket, "alice").await.unwrap();
        assert_eq!(version, 2);
        assert!(h.controller.get_limits(&bucket).defaulted);
    }
}
