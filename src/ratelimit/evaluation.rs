//! The atomic evaluate-and-consume step.
//!
//! [`evaluate_checks`] is what a store executes inside its atomic section:
//! given the current records for every bucket a request touches, it decides
//! the request and returns the records to write back. It is pure, so any
//! store that can run it without interleaving on the same keys is correct.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::PriorityClass;
use crate::store::StoreKey;

use super::bucket::{BucketState, TOKEN_EPSILON};
use super::fairness::{AllowancePlan, FairnessScheduler, WindowLedger};

/// Everything persisted for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub state: BucketState,
    #[serde(default)]
    pub ledger: WindowLedger,
    /// Last time an evaluation touched this record, in epoch milliseconds
    #[serde(default)]
    pub last_seen_ms: u64,
}

impl BucketRecord {
    /// A fresh, full record.
    pub fn new(limits: BucketLimits, now_ms: u64) -> Self {
        Self {
            state: BucketState::full(limits.capacity, limits.refill_rate, now_ms),
            ledger: WindowLedger::default(),
            last_seen_ms: now_ms,
        }
    }
}

/// Capacity and refill rate passed to the store with every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimits {
    pub capacity: f64,
    pub refill_rate: f64,
}

/// The fairness gate applied to a bucket check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassGate {
    /// Class the request belongs to
    pub class: String,
    /// Every class sharing the bucket
    pub classes: Vec<PriorityClass>,
    pub scheduler: FairnessScheduler,
}

/// One bucket a request must pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketCheck {
    pub key: StoreKey,
    pub limits: BucketLimits,
    #[serde(default)]
    pub gate: Option<ClassGate>,
}

/// Whether an evaluation may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Record demand and consume tokens on success.
    Consume,
    /// Compute the decision only.
    DryRun,
}

/// A request for the store's atomic evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub now_ms: u64,
    pub requested: f64,
    pub mode: EvalMode,
    /// Unique per attempt; a repeated id returns the recorded outcome
    #[serde(default)]
    pub attempt_id: Option<Uuid>,
    /// Buckets that must all admit, in order
    pub checks: Vec<BucketCheck>,
}

/// Which gate refused a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialGate {
    ClassAllowance,
    Tokens,
}

/// Outcome of one bucket check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub key: StoreKey,
    /// Whether this check's gates passed
    pub passed: bool,
    pub denied_by: Option<DenialGate>,
    /// Tokens after the decision (refilled, and decremented if admitted)
    pub tokens_after: f64,
    /// When this check would pass, in epoch milliseconds; `None` if never
    pub next_deadline_ms: Option<u64>,
    pub plan: Option<AllowancePlan>,
}

/// Outcome of a whole evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    /// Every check passed and, in consume mode, tokens were taken
    pub allowed: bool,
    pub checks: Vec<CheckOutcome>,
}

impl EvalOutcome {
    /// Fewest tokens left across all checked buckets.
    pub fn tokens_remaining(&self) -> f64 {
        self.checks
            .iter()
            .map(|c| c.tokens_after)
            .fold(f64::INFINITY, f64::min)
    }
}

/// Decide `request` against `records` (one per check, `None` for missing).
///
/// Returns the outcome and the records to persist. In dry-run mode the
/// caller must discard the records.
pub fn evaluate_checks(
    request: &EvalRequest,
    records: Vec<Option<BucketRecord>>,
) -> (EvalOutcome, Vec<BucketRecord>) {
    let now = request.now_ms;
    let requested = request.requested;

    let mut working: Vec<BucketRecord> = records
        .into_iter()
        .zip(&request.checks)
        .map(|(record, check)| {
            let mut record = record.unwrap_or_else(|| BucketRecord::new(check.limits, now));
            record
                .state
                .reconfigure(check.limits.capacity, check.limits.refill_rate);
            record
        })
        .collect();

    let mut originals = Vec::with_capacity(working.len());
    let mut checks = Vec::with_capacity(working.len());

    for (record, check) in working.iter_mut().zip(&request.checks) {
        originals.push(record.state.clone());

        let mut gate_passed = true;
        let mut plan = None;
        let mut gate_deadline = None;
        if let Some(gate) = &check.gate {
            let window_ms = gate.scheduler.window_ms();
            record.ledger.roll(now, window_ms);
            record.ledger.record_demand(&gate.class, requested);

            let supply = gate
                .scheduler
                .supply(check.limits.capacity, check.limits.refill_rate);
            let computed = gate.scheduler.plan(&gate.classes, &record.ledger, supply, now);
            let decision = gate
                .scheduler
                .gate(&computed, &mut record.ledger, &gate.class, requested, now);
            gate_passed = decision.passed;
            // A class accruing nothing is re-planned at the next window.
            gate_deadline = Some(
                decision
                    .deadline_ms
                    .unwrap_or_else(|| record.ledger.window_end_ms(window_ms)),
            );
            plan = Some(computed);
        }

        record.state.refill(now);
        let has_tokens = record.state.has_tokens(requested);
        let token_deadline = record.state.deadline_for(requested, now);

        let (denied_by, next_deadline_ms) = if !gate_passed {
            let deadline = gate_deadline
                .zip(token_deadline)
                .map(|(credit, tokens)| credit.max(tokens));
            (Some(DenialGate::ClassAllowance), deadline)
        } else if !has_tokens {
            (Some(DenialGate::Tokens), token_deadline)
        } else {
            (None, Some(now))
        };

        checks.push(CheckOutcome {
            key: check.key.clone(),
            passed: denied_by.is_none(),
            denied_by,
            tokens_after: record.state.tokens,
            next_deadline_ms,
            plan,
        });
    }

    let allowed = checks.iter().all(|c| c.passed);

    for (((record, check), outcome), original) in working
        .iter_mut()
        .zip(&request.checks)
        .zip(checks.iter_mut())
        .zip(originals)
    {
        record.last_seen_ms = record.last_seen_ms.max(now);
        if allowed {
            record.state.tokens = (record.state.tokens - requested).max(0.0);
            if record.state.tokens < TOKEN_EPSILON {
                record.state.tokens = 0.0;
            }
            outcome.tokens_after = record.state.tokens;
            if let Some(gate) = &check.gate {
                record.ledger.record_admitted(&gate.class, requested);
                if outcome.plan.as_ref().is_some_and(|plan| plan.contended) {
                    record.ledger.charge_credit(&gate.class, requested);
                }
            }
        } else {
            // Denied requests leave the token state exactly as it was.
            record.state = original;
        }
    }

    (EvalOutcome { allowed, checks }, working)
}
