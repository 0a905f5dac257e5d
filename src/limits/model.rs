//! Limit configuration model, YAML loading, and validation.
//!
//! A [`LimitConfiguration`] is a versioned, immutable value. Every field is
//! checked at the write boundary by [`LimitConfiguration::validate`]; nothing
//! downstream re-validates it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::error::{FairgateError, Result};

/// Tolerance when checking that guaranteed fractions sum to at most 1.0.
const FRACTION_EPSILON: f64 = 1e-9;

/// Default capacity for buckets created lazily from the default template.
const DEFAULT_CAPACITY: f64 = 200.0;
/// Default refill rate for buckets created lazily from the default template.
const DEFAULT_REFILL_RATE: f64 = 100.0;

/// Bucket keys that collide with other records under the same scope.
const RESERVED_KEYS: [&str; 2] = ["config", "global"];

/// Identifies a bucket, e.g. `tenant-a/emails`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a composite key from a tenant and a queue name.
    pub fn composite(tenant: &str, queue: &str) -> Self {
        Self(format!("{}/{}", tenant, queue))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// A named traffic category sharing a bucket's capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityClass {
    /// Class name, unique under its bucket
    pub name: String,
    /// Relative share against sibling classes
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Fraction of capacity reserved for this class whenever it has demand
    #[serde(default)]
    pub min_guaranteed_fraction: Option<f64>,
}

fn default_weight() -> u32 {
    1
}

impl PriorityClass {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            min_guaranteed_fraction: None,
        }
    }

    /// Reserve a fraction of capacity for this class.
    pub fn with_floor(mut self, fraction: f64) -> Self {
        self.min_guaranteed_fraction = Some(fraction);
        self
    }

    /// The guaranteed fraction, zero when none is configured.
    pub fn floor(&self) -> f64 {
        self.min_guaranteed_fraction.unwrap_or(0.0)
    }
}

/// What `acquire` does when the store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and log loudly.
    FailOpen,
    /// Reject the request.
    #[default]
    FailClosed,
}

/// Template and fairness rules for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDefinition {
    /// Maximum tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate_per_second: f64,
    /// Priority classes sharing this bucket; empty disables the fairness gate
    #[serde(default)]
    pub classes: Vec<PriorityClass>,
    /// Behavior when the store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Skip the configuration-wide global limit
    #[serde(default)]
    pub exempt_from_global: bool,
}

impl Default for BucketDefinition {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_rate_per_second: DEFAULT_REFILL_RATE,
            classes: Vec::new(),
            failure_policy: FailurePolicy::default(),
            exempt_from_global: false,
        }
    }
}

impl BucketDefinition {
    pub fn new(capacity: f64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: PriorityClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Option<&PriorityClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Check every invariant of this definition.
    pub fn validate(&self, bucket: &str) -> std::result::Result<(), ValidationError> {
        validate_rates(bucket, self.capacity, self.refill_rate_per_second)?;

        let mut seen = HashSet::new();
        let mut reserved = 0.0;
        for class in &self.classes {
            if class.name.trim().is_empty() {
                return Err(ValidationError::EmptyClassName {
                    bucket: bucket.to_string(),
                });
            }
            if !seen.insert(class.name.as_str()) {
                return Err(ValidationError::DuplicateClass {
                    bucket: bucket.to_string(),
                    class: class.name.clone(),
                });
            }
            if let Some(fraction) = class.min_guaranteed_fraction {
                if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
                    return Err(ValidationError::FractionOutOfRange {
                        bucket: bucket.to_string(),
                        class: class.name.clone(),
                        fraction,
                    });
                }
                reserved += fraction;
            }
        }

        if reserved > 1.0 + FRACTION_EPSILON {
            return Err(ValidationError::ReservationsExceedCapacity {
                bucket: bucket.to_string(),
                total: reserved,
            });
        }

        Ok(())
    }
}

/// A configuration-wide limit checked alongside every non-exempt bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalLimit {
    pub capacity: f64,
    pub refill_rate_per_second: f64,
}

/// The full, versioned set of bucket definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LimitConfiguration {
    /// Monotonically increasing version, assigned by the registry on publish
    #[serde(default)]
    pub version: u64,
    /// Template for buckets that are not listed explicitly
    #[serde(default)]
    pub default_bucket: BucketDefinition,
    /// Optional limit shared by every non-exempt bucket
    #[serde(default)]
    pub global: Option<GlobalLimit>,
    /// Explicitly configured buckets
    #[serde(default)]
    pub buckets: BTreeMap<BucketKey, BucketDefinition>,
    /// Actor that published this version
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Publish time in epoch milliseconds
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl LimitConfiguration {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitConfiguration = serde_yaml::from_str(yaml)
            .map_err(|e| FairgateError::Config(format!("Failed to parse limit config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Add or replace a bucket definition.
    pub fn with_bucket(mut self, key: impl Into<BucketKey>, definition: BucketDefinition) -> Self {
        self.buckets.insert(key.into(), definition);
        self
    }

    pub fn with_global(mut self, capacity: f64, refill_rate_per_second: f64) -> Self {
        self.global = Some(GlobalLimit {
            capacity,
            refill_rate_per_second,
        });
        self
    }

    /// The definition governing `key`, and whether it came from the default template.
    pub fn definition_for(&self, key: &BucketKey) -> (&BucketDefinition, bool) {
        match self.buckets.get(key) {
            Some(definition) => (definition, false),
            None => (&self.default_bucket, true),
        }
    }

    /// Check every invariant of the configuration.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        self.default_bucket.validate("default_bucket")?;
        if let Some(global) = &self.global {
            validate_rates("global", global.capacity, global.refill_rate_per_second)?;
        }
        for (key, definition) in &self.buckets {
            validate_key(key)?;
            definition.validate(key.as_str())?;
        }
        Ok(())
    }
}

fn validate_key(key: &BucketKey) -> std::result::Result<(), ValidationError> {
    if key.as_str().trim().is_empty() {
        return Err(ValidationError::EmptyBucketKey);
    }
    if RESERVED_KEYS.contains(&key.as_str()) {
        return Err(ValidationError::ReservedBucketKey {
            bucket: key.to_string(),
        });
    }
    Ok(())
}

fn validate_rates(bucket: &str, capacity: f64, refill: f64) -> std::result::Result<(), ValidationError> {
    if !capacity.is_finite() || capacity <= 0.0 {
        return Err(ValidationError::NonPositiveCapacity {
            bucket: bucket.to_string(),
            capacity,
        });
    }
    if !refill.is_finite() || refill < 0.0 {
        return Err(ValidationError::NegativeRefillRate {
            bucket: bucket.to_string(),
            rate: refill,
        });
    }
    Ok(())
}

/// A configuration update violated an invariant.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("bucket key must not be empty")]
    EmptyBucketKey,

    #[error("bucket key {bucket:?} is reserved")]
    ReservedBucketKey { bucket: String },

    #[error("bucket {bucket}: capacity must be positive, got {capacity}")]
    NonPositiveCapacity { bucket: String, capacity: f64 },

    #[error("bucket {bucket}: refill rate must be non-negative, got {rate}")]
    NegativeRefillRate { bucket: String, rate: f64 },

    #[error("bucket {bucket}: class name must not be empty")]
    EmptyClassName { bucket: String },

    #[error("bucket {bucket}: class {class} is defined more than once")]
    DuplicateClass { bucket: String, class: String },

    #[error("bucket {bucket}: class {class} guaranteed fraction {fraction} is outside [0, 1]")]
    FractionOutOfRange {
        bucket: String,
        class: String,
        fraction: f64,
    },

    #[error("bucket {bucket}: guaranteed fractions sum to {total}, exceeding 1.0")]
    ReservationsExceedCapacity { bucket: String, total: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
default_bucket:
  capacity: 50
  refill_rate_per_second: 10
global:
  capacity: 1000
  refill_rate_per_second: 500
buckets:
  tenant-a/emails:
    capacity: 10
    refill_rate_per_second: 1
    failure_policy: fail_open
    classes:
      - name: critical
        weight: 8
        min_guaranteed_fraction: 0.3
      - name: bulk
        weight: 1
"#;
        let config = LimitConfiguration::from_yaml(yaml).unwrap();
        assert_eq!(config.default_bucket.capacity, 50.0);
        assert_eq!(config.global.as_ref().unwrap().capacity, 1000.0);

        let bucket = &config.buckets[&BucketKey::new("tenant-a/emails")];
        assert_eq!(bucket.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(bucket.classes.len(), 2);
        assert_eq!(bucket.class("critical").unwrap().floor(), 0.3);
        assert_eq!(bucket.class("bulk").unwrap().floor(), 0.0);
        assert!(!bucket.exempt_from_global);
    }

    #[test]
    fn test_definition_for_falls_back_to_default() {
        let config = LimitConfiguration::new().with_bucket("a/b", BucketDefinition::new(5.0, 1.0));

        let (definition, defaulted) = config.definition_for(&BucketKey::new("a/b"));
        assert_eq!(definition.capacity, 5.0);
        assert!(!defaulted);

        let (definition, defaulted) = config.definition_for(&BucketKey::new("other"));
        assert_eq!(definition.capacity, DEFAULT_CAPACITY);
        assert!(defaulted);
    }

    #[test]
    fn test_reservations_over_one_rejected() {
        let definition = BucketDefinition::new(10.0, 1.0)
            .with_class(PriorityClass::new("a", 1).with_floor(0.7))
            .with_class(PriorityClass::new("b", 1).with_floor(0.5));

        let err = definition.validate("t/q").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ReservationsExceedCapacity { total, .. } if (total - 1.2).abs() < 1e-9
        ));
    }

    #[test]
    fn test_reservations_exactly_one_accepted() {
        let definition = BucketDefinition::new(10.0, 1.0)
            .with_class(PriorityClass::new("a", 1).with_floor(0.7))
            .with_class(PriorityClass::new("b", 1).with_floor(0.3));
        assert!(definition.validate("t/q").is_ok());
    }

    #[test]
    fn test_invalid_rates_rejected() {
        assert!(matches!(
            BucketDefinition::new(0.0, 1.0).validate("x"),
            Err(ValidationError::NonPositiveCapacity { .. })
        ));
        assert!(matches!(
            BucketDefinition::new(1.0, -0.5).validate("x"),
            Err(ValidationError::NegativeRefillRate { .. })
        ));
        assert!(matches!(
            BucketDefinition::new(f64::NAN, 1.0).validate("x"),
            Err(ValidationError::NonPositiveCapacity { .. })
        ));
        assert!(BucketDefinition::new(1.0, 0.0).validate("x").is_ok());
    }

    #[test]
    fn test_class_rules() {
        let duplicate = BucketDefinition::new(1.0, 1.0)
            .with_class(PriorityClass::new("a", 1))
            .with_class(PriorityClass::new("a", 2));
        assert!(matches!(
            duplicate.validate("x"),
            Err(ValidationError::DuplicateClass { .. })
        ));

        let empty = BucketDefinition::new(1.0, 1.0).with_class(PriorityClass::new(" ", 1));
        assert!(matches!(
            empty.validate("x"),
            Err(ValidationError::EmptyClassName { .. })
        ));

        let negative = BucketDefinition::new(1.0, 1.0)
            .with_class(PriorityClass::new("a", 1).with_floor(-0.1));
        assert!(matches!(
            negative.validate("x"),
            Err(ValidationError::FractionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let config = LimitConfiguration::new().with_bucket("config", BucketDefinition::default());
        assert!(matches!(
            config.validate(),
            Err(ValidationError::ReservedBucketKey { .. })
        ));
    }

    #[test]
    fn test_negative_weight_fails_to_parse() {
        let yaml = r#"
buckets:
  t/q:
    capacity: 10
    refill_rate_per_second: 1
    classes:
      - name: a
        weight: -1
"#;
        assert!(matches!(
            LimitConfiguration::from_yaml(yaml),
            Err(FairgateError::Config(_))
        ));
    }

    #[test]
    fn test_json_round_trip_preserves_keys() {
        let config = LimitConfiguration::new()
            .with_bucket("t/q", BucketDefinition::new(3.0, 1.0))
            .with_global(100.0, 10.0);
        let doc = serde_json::to_string(&config).unwrap();
        let parsed: LimitConfiguration = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed, config);
    }
}
