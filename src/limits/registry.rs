//! The limit registry.
//!
//! Readers get the current [`LimitConfiguration`] from an [`ArcSwap`] and
//! never wait on writers. Writers are serialized in-process, persist the
//! whole configuration as one document with a compare-and-swap against the
//! store, and only then publish the new snapshot.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::{FairgateError, Result};
use crate::ratelimit::{AcquireOutcome, Admission, EvalMode, FairnessScheduler, Pipeline};
use crate::store::{with_timeout, BucketStore, StoreKey};

use super::model::{BucketDefinition, BucketKey, GlobalLimit, LimitConfiguration};

/// Attempts at publishing before giving up on a contended configuration document.
const MAX_PUBLISH_ATTEMPTS: usize = 3;

/// Default upper bound on a store round trip.
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// The configuration governing one bucket, taken from a single snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    /// Version of the configuration this was read from
    pub version: u64,
    pub bucket: BucketKey,
    pub definition: BucketDefinition,
    /// The bucket is not listed and uses the default template
    pub defaulted: bool,
}

/// Owns the live limit configuration.
pub struct LimitRegistry<S: BucketStore + ?Sized> {
    store: Arc<S>,
    scope: String,
    current: ArcSwap<LimitConfiguration>,
    writer: Mutex<()>,
    scheduler: FairnessScheduler,
    operation_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<S: BucketStore + ?Sized> LimitRegistry<S> {
    /// Create a registry publishing `initial` until the first update or sync.
    pub fn new(store: Arc<S>, scope: impl Into<String>, initial: LimitConfiguration) -> Self {
        Self {
            store,
            scope: scope.into(),
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
            scheduler: FairnessScheduler::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: FairnessScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// The current configuration snapshot.
    pub fn snapshot(&self) -> Arc<LimitConfiguration> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// The configuration governing `bucket`.
    pub fn get(&self, bucket: &BucketKey) -> BucketSnapshot {
        let config = self.current.load();
        let (definition, defaulted) = config.definition_for(bucket);
        BucketSnapshot {
            version: config.version,
            bucket: bucket.clone(),
            definition: definition.clone(),
            defaulted,
        }
    }

    /// Add or replace one bucket definition.
    pub async fn update(
        &self,
        bucket: &BucketKey,
        definition: BucketDefinition,
        actor: &str,
    ) -> Result<Arc<LimitConfiguration>> {
        info!(actor = %actor, bucket = %bucket, "Updating bucket limits");
        self.publish(actor, |config| {
            config.buckets.insert(bucket.clone(), definition.clone());
        })
        .await
    }

    /// Remove a bucket definition so the bucket falls back to the default template.
    pub async fn remove(&self, bucket: &BucketKey, actor: &str) -> Result<Arc<LimitConfiguration>> {
        info!(actor = %actor, bucket = %bucket, "Removing bucket limits");
        self.publish(actor, |config| {
            config.buckets.remove(bucket);
        })
        .await
    }

    /// Set or clear the global limit.
    pub async fn set_global(
        &self,
        global: Option<GlobalLimit>,
        actor: &str,
    ) -> Result<Arc<LimitConfiguration>> {
        info!(actor = %actor, enabled = global.is_some(), "Updating global limit");
        self.publish(actor, |config| {
            config.global = global.clone();
        })
        .await
    }

    /// Replace the whole configuration, keeping version numbering monotonic.
    pub async fn replace(
        &self,
        replacement: LimitConfiguration,
        actor: &str,
    ) -> Result<Arc<LimitConfiguration>> {
        info!(actor = %actor, buckets = replacement.buckets.len(), "Replacing limit configuration");
        self.publish(actor, |config| {
            *config = replacement.clone();
        })
        .await
    }

    /// Adopt a newer configuration published by another replica.
    ///
    /// Returns whether the local snapshot changed.
    pub async fn sync(&self) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let key = StoreKey::config(&self.scope);
        let Some(document) = with_timeout(self.operation_timeout, self.store.load_document(&key)).await?
        else {
            return Ok(false);
        };

        let stored: LimitConfiguration = serde_json::from_str(&document)?;
        let local_version = self.current.load().version;
        if stored.version <= local_version {
            return Ok(false);
        }

        info!(
            from = local_version,
            to = stored.version,
            updated_by = stored.updated_by.as_deref().unwrap_or("unknown"),
            "Adopted newer limit configuration"
        );
        self.current.store(Arc::new(stored));
        Ok(true)
    }

    /// Project the decision a real acquisition would receive, without
    /// changing any bucket state.
    pub async fn dry_run(&self, bucket: &BucketKey, class: &str, tokens: u32) -> Result<AcquireOutcome> {
        let config = self.snapshot();
        let pipeline = Pipeline {
            scope: &self.scope,
            scheduler: self.scheduler,
            config: &config,
            timeout: self.operation_timeout,
        };
        let admission = Admission {
            bucket,
            class,
            tokens,
            mode: EvalMode::DryRun,
            attempt_id: None,
        };

        let result = pipeline
            .run(self.store.as_ref(), &admission, self.clock.now_millis())
            .await?;
        debug!(bucket = %bucket, class = %class, outcome = ?result.outcome, "Dry run");
        Ok(result.outcome)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn scheduler(&self) -> FairnessScheduler {
        self.scheduler
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Apply `mutate` to the newest known configuration and publish it.
    ///
    /// Nothing is persisted or published if the result fails validation.
    async fn publish<F>(&self, actor: &str, mutate: F) -> Result<Arc<LimitConfiguration>>
    where
        F: Fn(&mut LimitConfiguration),
    {
        let _guard = self.writer.lock().await;
        let key = StoreKey::config(&self.scope);

        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let stored = with_timeout(self.operation_timeout, self.store.load_document(&key)).await?;

            let local = self.current.load_full();
            let base = match stored.as_deref() {
                Some(document) => {
                    let remote: LimitConfiguration = serde_json::from_str(document)?;
                    if remote.version > local.version {
                        Arc::new(remote)
                    } else {
                        local
                    }
                }
                None => local,
            };

            let mut next = (*base).clone();
            mutate(&mut next);
            next.version = base.version + 1;
            next.updated_by = Some(actor.to_string());
            next.updated_at_ms = self.clock.now_millis();
            next.validate()?;

            let document = serde_json::to_string(&next)?;
            let swapped = with_timeout(
                self.operation_timeout,
                self.store.swap_document(&key, stored.as_deref(), &document),
            )
            .await?;

            if swapped {
                let next = Arc::new(next);
                self.current.store(next.clone());
                info!(actor = %actor, version = next.version, "Published limit configuration");
                return Ok(next);
            }

            debug!(attempt = attempt, "Configuration document changed concurrently, retrying");
        }

        Err(FairgateError::Config(format!(
            "configuration document kept changing; gave up after {} attempts",
            MAX_PUBLISH_ATTEMPTS
        )))
    }
}
