//! Sliding-window hit counting over a shared store.
//!
//! Each subject owns one hash in the store whose fields are bucket indexes
//! on a ring. A write increments the current bucket, clears the buckets that
//! will next enter the rate window, and renews the key's expiry. A read sums
//! the most recent buckets and runs the same clearing pass. Both are sent as
//! one atomic batch, so concurrent instances never observe half an update.

use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use super::clock::BucketClock;
use super::estimator::{CountAggregate, Estimator, RateSnapshot, ThroughputEstimator};
use super::key::KeyBuilder;
use crate::config::{WindowConfig, WindowLayout};
use crate::error::Result;
use crate::store::{Batch, OpOutcome, StoreError, WindowStore};

/// Records hits per subject and reports windowed counts and rates.
///
/// The engine holds no mutable state of its own; every counter lives in the
/// injected store, so any number of engines in any number of processes can
/// share one store.
pub struct RateLimitEngine<S: WindowStore + ?Sized> {
    /// The shared counter store
    store: Arc<S>,
    /// Window key construction
    keys: KeyBuilder,
    /// Time to bucket mapping
    clock: BucketClock,
    /// Derived ring geometry
    layout: WindowLayout,
    /// Aggregate to rate conversion
    estimator: ThroughputEstimator,
    /// Estimate returned by `current_rate`
    selected: Estimator,
}

impl<S: WindowStore + ?Sized> std::fmt::Debug for RateLimitEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitEngine")
            .field("keys", &self.keys)
            .field("clock", &self.clock)
            .field("layout", &self.layout)
            .field("selected", &self.selected)
            .finish()
    }
}

impl<S: WindowStore + ?Sized> RateLimitEngine<S> {
    /// Create an engine over `store`.
    ///
    /// Fails with a configuration error when the bucket geometry is
    /// inconsistent (see [`WindowConfig::validate`]).
    pub fn new(store: Arc<S>, config: &WindowConfig) -> Result<Self> {
        let layout = config.validate()?;
        let keys = KeyBuilder::new(config.namespace.as_deref(), &config.action);

        debug!(
            action = %keys,
            bucket_count = layout.bucket_count,
            buckets_used_for_rate = layout.buckets_used_for_rate,
            buckets_to_evict = layout.buckets_to_evict,
            "Rate limit engine configured"
        );

        Ok(Self {
            store,
            keys,
            clock: BucketClock::new(config.bucket_span, config.bucket_interval),
            layout,
            estimator: ThroughputEstimator::new(config.rate_interval, config.bucket_interval),
            selected: config.estimator,
        })
    }

    /// Record one hit for `subject` at `time_millis` (epoch milliseconds).
    pub async fn add(&self, time_millis: u64, subject: &str) -> Result<()> {
        self.add_hits(time_millis, subject, 1).await
    }

    /// Record `hits` hits for `subject` at `time_millis`.
    ///
    /// Increment, eviction and expiry renewal are applied together or not at
    /// all; a failed batch is returned as an error and never retried.
    ///
    /// The one exception is a current bucket that does not hold an integer.
    /// The store rejects that batch untouched, and it is resubmitted once
    /// with a delete of the corrupt field ahead of the increment, so the
    /// bucket restarts from zero. Any failure of the resubmitted batch is
    /// returned as is.
    #[instrument(skip(self), fields(action = %self.keys))]
    pub async fn add_hits(&self, time_millis: u64, subject: &str, hits: u32) -> Result<()> {
        let key = self.keys.key(subject);
        let current = self.clock.bucket_of(time_millis);

        let batch = self.add_batch(&key, current, hits, None);
        trace!(key = %key, bucket = current, ops = batch.len(), "Sending add batch");

        match self.store.execute_batch(batch).await {
            Ok(_) => {}
            Err(StoreError::CorruptField { field, .. }) => {
                warn!(key = %key, field = %field, "Replacing corrupt bucket");
                let batch = self.add_batch(&key, current, hits, Some(field.as_str()));
                self.store.execute_batch(batch).await.map_err(|e| {
                    warn!(key = %key, error = %e, "Failed to record hit");
                    e
                })?;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to record hit");
                return Err(e.into());
            }
        }

        debug!(key = %key, bucket = current, hits = hits, "Recorded hits");
        Ok(())
    }

    /// Record one hit for each subject at the same time.
    ///
    /// Subjects are independent: each gets its own batch and its own result,
    /// returned in input order.
    pub async fn add_all<I, T>(&self, time_millis: u64, subjects: I) -> Vec<Result<()>>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let adds = subjects
            .into_iter()
            .map(move |subject| async move { self.add(time_millis, subject.as_ref()).await });
        futures::future::join_all(adds).await
    }

    /// Aggregate the most recent buckets for `subject`, ending with the
    /// bucket that contains `time_millis`.
    ///
    /// Also clears the buckets ahead of the current one, so a subject that is
    /// only ever read still has a clean ring when it wraps.
    #[instrument(skip(self), fields(action = %self.keys))]
    pub async fn count(&self, time_millis: u64, subject: &str) -> Result<CountAggregate> {
        let key = self.keys.key(subject);
        let current = self.clock.bucket_of(time_millis);

        // Newest first: current, current - 1, ...
        let fields: Vec<String> = (0..self.layout.buckets_used_for_rate)
            .map(|back| self.clock.step(current, -(back as i64)).to_string())
            .collect();

        let mut batch = Batch::new();
        for field in &fields {
            batch.get(&key, field);
        }
        self.push_eviction(&mut batch, &key, current);

        trace!(key = %key, bucket = current, ops = batch.len(), "Sending count batch");

        let outcomes = self.store.execute_batch(batch).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to count hits");
            e
        })?;

        if outcomes.len() < fields.len() {
            return Err(StoreError::Protocol(format!(
                "expected at least {} replies, got {}",
                fields.len(),
                outcomes.len()
            ))
            .into());
        }

        let mut aggregate = CountAggregate::default();
        let mut corrupt = Vec::new();

        for (position, (field, outcome)) in fields.iter().zip(outcomes).enumerate() {
            let value = match outcome {
                OpOutcome::Field(None) => 0,
                OpOutcome::Field(Some(raw)) => match raw.parse::<i64>() {
                    Ok(value) => value,
                    Err(_) => {
                        warn!(key = %key, field = %field, value = %raw, "Discarding corrupt bucket");
                        corrupt.push((field.as_str(), raw));
                        0
                    }
                },
                other => {
                    return Err(StoreError::Protocol(format!(
                        "unexpected outcome {:?} for read of {}",
                        other, field
                    ))
                    .into());
                }
            };

            if position == 0 {
                aggregate.latest_bucket_count = value;
            }
            aggregate.sum = aggregate.sum.saturating_add(value);
            aggregate.peak_count = aggregate.peak_count.max(value);
            if value == 0 {
                aggregate.number_of_empty_buckets += 1;
            }
        }

        if !corrupt.is_empty() {
            self.discard_fields(&key, &corrupt).await;
        }

        debug!(
            key = %key,
            bucket = current,
            sum = aggregate.sum,
            peak = aggregate.peak_count,
            empty = aggregate.number_of_empty_buckets,
            "Counted hits"
        );
        Ok(aggregate)
    }

    /// All rate estimates for `subject` at `time_millis`.
    pub async fn rate(&self, time_millis: u64, subject: &str) -> Result<RateSnapshot> {
        let aggregate = self.count(time_millis, subject).await?;
        Ok(self.estimator.estimate(aggregate))
    }

    /// The configured estimate for `subject` at `time_millis`, in hits per
    /// second.
    pub async fn current_rate(&self, time_millis: u64, subject: &str) -> Result<f64> {
        Ok(self.rate(time_millis, subject).await?.select(self.selected))
    }

    /// [`add`](Self::add) at the current wall-clock time.
    pub async fn add_now(&self, subject: &str) -> Result<()> {
        self.add(now_millis(), subject).await
    }

    /// [`count`](Self::count) at the current wall-clock time.
    pub async fn count_now(&self, subject: &str) -> Result<CountAggregate> {
        self.count(now_millis(), subject).await
    }

    /// [`rate`](Self::rate) at the current wall-clock time.
    pub async fn rate_now(&self, subject: &str) -> Result<RateSnapshot> {
        self.rate(now_millis(), subject).await
    }

    /// Derived ring geometry.
    pub fn layout(&self) -> WindowLayout {
        self.layout
    }

    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Estimate returned by [`current_rate`](Self::current_rate).
    pub fn selected_estimator(&self) -> Estimator {
        self.selected
    }

    /// Increment of `current`, eviction pass and expiry renewal, optionally
    /// preceded by a delete of `clear`.
    fn add_batch(&self, key: &str, current: usize, hits: u32, clear: Option<&str>) -> Batch {
        let mut batch = Batch::new();
        if let Some(field) = clear {
            batch.delete(key, field);
        }
        batch.increment(key, &current.to_string(), i64::from(hits));
        self.push_eviction(&mut batch, key, current);
        batch.expire(key, self.layout.expiry_secs);
        batch
    }

    /// Queue deletes for the `buckets_to_evict` slots after `current`.
    fn push_eviction(&self, batch: &mut Batch, key: &str, current: usize) {
        for ahead in 1..=self.layout.buckets_to_evict {
            let index = self.clock.step(current, ahead as i64);
            batch.delete(key, &index.to_string());
        }
    }

    /// Best-effort removal of fields that do not hold an integer.
    ///
    /// Each field is only removed while it still holds the value that was
    /// read, so a bucket another instance has reset in the meantime keeps its
    /// new count.
    async fn discard_fields(&self, key: &str, fields: &[(&str, String)]) {
        let mut batch = Batch::new();
        for (field, raw) in fields {
            batch.discard(key, field, raw);
        }
        if let Err(e) = self.store.execute_batch(batch).await {
            warn!(key = %key, error = %e, "Failed to discard corrupt buckets");
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
