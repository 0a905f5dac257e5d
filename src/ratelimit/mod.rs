//! Rate limiting logic: token buckets, priority fairness, and the admission
//! pipeline that ties them to a store.

mod backpressure;
mod bucket;
mod decision;
mod evaluation;
mod fairness;
mod pipeline;

pub use backpressure::{suggested_concurrency, BackpressureHint, ThrottleSignals};
pub use bucket::{BucketState, Evaluation, TOKEN_EPSILON};
pub use decision::{AcquireOutcome, LimitedBy, RejectReason};
pub use evaluation::{
    evaluate_checks, BucketCheck, BucketLimits, BucketRecord, CheckOutcome, ClassGate, DenialGate,
    EvalMode, EvalOutcome, EvalRequest,
};
pub use fairness::{
    AllowancePlan, ClassAllowance, ClassCredit, ClassUsage, FairnessScheduler, GateDecision, WindowLedger,
};
pub use pipeline::{interpret, Admission, Pipeline, PipelineOutcome};
