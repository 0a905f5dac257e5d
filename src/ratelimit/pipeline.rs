//! The admission pipeline: configuration lookup, one atomic store
//! evaluation, and translation of the store's outcome into a decision.

use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::Result;
use crate::limits::{BucketKey, LimitConfiguration};
use crate::report::ConfigurationWarning;
use crate::store::{with_timeout, BucketStore, StoreKey};

use super::bucket::TOKEN_EPSILON;
use super::decision::{AcquireOutcome, LimitedBy, RejectReason};
use super::evaluation::{
    BucketCheck, BucketLimits, ClassGate, DenialGate, EvalMode, EvalOutcome, EvalRequest,
};
use super::fairness::FairnessScheduler;

/// One request flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Admission<'a> {
    pub bucket: &'a BucketKey,
    pub class: &'a str,
    pub tokens: u32,
    pub mode: EvalMode,
    pub attempt_id: Option<Uuid>,
}

/// Decision plus any warnings raised while reaching it.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub outcome: AcquireOutcome,
    pub warnings: Vec<ConfigurationWarning>,
}

impl PipelineOutcome {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            outcome: AcquireOutcome::Rejected { reason },
            warnings: Vec::new(),
        }
    }
}

/// Shared context for running admissions against a store.
#[derive(Debug, Clone)]
pub struct Pipeline<'a> {
    pub scope: &'a str,
    pub scheduler: FairnessScheduler,
    pub config: &'a LimitConfiguration,
    pub timeout: Duration,
}

impl<'a> Pipeline<'a> {
    /// Build the store request for `admission`, or the rejection that makes
    /// a store round trip pointless.
    pub fn build_request(
        &self,
        admission: &Admission<'_>,
        now_ms: u64,
    ) -> std::result::Result<EvalRequest, RejectReason> {
        if admission.tokens == 0 {
            return Err(RejectReason::InvalidRequest {
                detail: "requested token count must be at least 1".to_string(),
            });
        }
        let requested = admission.tokens as f64;
        let (definition, _) = self.config.definition_for(admission.bucket);

        let gate = if definition.classes.is_empty() {
            None
        } else if definition.class(admission.class).is_some() {
            Some(ClassGate {
                class: admission.class.to_string(),
                classes: definition.classes.clone(),
                scheduler: self.scheduler,
            })
        } else {
            return Err(RejectReason::UnknownClass {
                class: admission.class.to_string(),
            });
        };

        if requested > definition.capacity + TOKEN_EPSILON {
            return Err(RejectReason::ExceedsCapacity {
                requested,
                capacity: definition.capacity,
            });
        }

        let mut checks = vec![BucketCheck {
            key: StoreKey::bucket(self.scope, admission.bucket),
            limits: BucketLimits {
                capacity: definition.capacity,
                refill_rate: definition.refill_rate_per_second,
            },
            gate,
        }];

        if let (Some(global), false) = (&self.config.global, definition.exempt_from_global) {
            if requested > global.capacity + TOKEN_EPSILON {
                return Err(RejectReason::ExceedsCapacity {
                    requested,
                    capacity: global.capacity,
                });
            }
            checks.push(BucketCheck {
                key: StoreKey::global(self.scope),
                limits: BucketLimits {
                    capacity: global.capacity,
                    refill_rate: global.refill_rate_per_second,
                },
                gate: None,
            });
        }

        Ok(EvalRequest {
            now_ms,
            requested,
            mode: admission.mode,
            attempt_id: admission.attempt_id,
            checks,
        })
    }

    /// Run `admission` through the store.
    ///
    /// Store failures are returned as errors; applying the bucket's failure
    /// policy is the caller's decision.
    pub async fn run<S: BucketStore + ?Sized>(
        &self,
        store: &S,
        admission: &Admission<'_>,
        now_ms: u64,
    ) -> Result<PipelineOutcome> {
        let request = match self.build_request(admission, now_ms) {
            Ok(request) => request,
            Err(reason) => {
                debug!(
                    bucket = %admission.bucket,
                    class = %admission.class,
                    reason = %reason,
                    "Request rejected before evaluation"
                );
                return Ok(PipelineOutcome::rejected(reason));
            }
        };

        trace!(
            bucket = %admission.bucket,
            class = %admission.class,
            tokens = admission.tokens,
            mode = ?admission.mode,
            "Evaluating admission"
        );

        let evaluation = with_timeout(self.timeout, store.eval_and_consume(&request)).await?;
        Ok(interpret(admission.bucket, &evaluation, now_ms))
    }
}

/// Translate a store outcome into an admission decision.
pub fn interpret(bucket: &BucketKey, evaluation: &EvalOutcome, now_ms: u64) -> PipelineOutcome {
    let warnings = evaluation
        .checks
        .iter()
        .filter_map(|check| check.plan.as_ref())
        .filter(|plan| plan.zero_weight_fallback)
        .map(|_| ConfigurationWarning::ZeroWeightSum {
            bucket: bucket.clone(),
        })
        .collect();

    if evaluation.allowed {
        return PipelineOutcome {
            outcome: AcquireOutcome::Granted {
                tokens_remaining: evaluation.tokens_remaining(),
                degraded: false,
            },
            warnings,
        };
    }

    let mut limited_by = None;
    let mut deadline = now_ms;
    for (index, check) in evaluation.checks.iter().enumerate() {
        let Some(gate) = check.denied_by else {
            continue;
        };
        let Some(check_deadline) = check.next_deadline_ms else {
            return PipelineOutcome {
                outcome: AcquireOutcome::Rejected {
                    reason: RejectReason::NoRefill,
                },
                warnings,
            };
        };
        deadline = deadline.max(check_deadline);
        limited_by.get_or_insert(match (gate, index) {
            (DenialGate::ClassAllowance, _) => LimitedBy::ClassAllowance,
            (DenialGate::Tokens, 0) => LimitedBy::Bucket,
            (DenialGate::Tokens, _) => LimitedBy::Global,
        });
    }

    let retry_after = Duration::from_millis(deadline.saturating_sub(now_ms));
    debug!(
        bucket = %bucket,
        retry_after_ms = retry_after.as_millis() as u64,
        limited_by = ?limited_by,
        "Request throttled"
    );

    PipelineOutcome {
        outcome: AcquireOutcome::Throttled {
            retry_after,
            limited_by: limited_by.unwrap_or(LimitedBy::Bucket),
        },
        warnings,
    }
}
