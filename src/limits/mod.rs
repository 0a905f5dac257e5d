//! Limit configuration and the runtime-mutable registry that publishes it.

mod model;
mod registry;

pub use model::{
    BucketDefinition, BucketKey, FailurePolicy, GlobalLimit, LimitConfiguration, PriorityClass,
    ValidationError,
};
pub use registry::{BucketSnapshot, LimitRegistry};
