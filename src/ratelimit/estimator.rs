//! Throughput estimation from a window aggregate.

use serde::{Deserialize, Serialize};

/// Counters read from the most recent buckets of a subject's ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountAggregate {
    /// Sum of all sampled buckets
    pub sum: i64,
    /// Largest single-bucket count
    pub peak_count: i64,
    /// Sampled buckets that were absent or zero
    pub number_of_empty_buckets: usize,
    /// Count in the current (possibly incomplete) bucket
    pub latest_bucket_count: i64,
}

/// Every rate estimate derived from one [`CountAggregate`], in hits per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    /// Hits over the whole rate interval. Reads low under sparse traffic
    /// because empty buckets count against it.
    pub average_rate: f64,
    /// Hits over only the non-empty part of the rate interval.
    pub average_rate_excluding_empty_buckets: f64,
    /// Rate of the busiest single bucket.
    pub peak_rate: f64,
    /// Rate of the current bucket alone.
    pub latest_bucket_rate: f64,
    /// The counters the rates were computed from.
    pub aggregate: CountAggregate,
}

/// Selects one of the estimates in a [`RateSnapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    #[default]
    Average,
    AverageExcludingEmpty,
    Peak,
    LatestBucket,
}

impl RateSnapshot {
    /// The estimate picked by `estimator`.
    pub fn select(&self, estimator: Estimator) -> f64 {
        match estimator {
            Estimator::Average => self.average_rate,
            Estimator::AverageExcludingEmpty => self.average_rate_excluding_empty_buckets,
            Estimator::Peak => self.peak_rate,
            Estimator::LatestBucket => self.latest_bucket_rate,
        }
    }
}

/// Turns window aggregates into rates for a fixed bucket geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputEstimator {
    rate_interval_secs: u64,
    bucket_interval_secs: u64,
}

impl ThroughputEstimator {
    pub fn new(rate_interval_secs: u64, bucket_interval_secs: u64) -> Self {
        Self {
            rate_interval_secs,
            bucket_interval_secs,
        }
    }

    /// Compute all four estimates.
    ///
    /// The sparse-corrected average divides by the seconds covered by
    /// non-empty buckets; when every sampled bucket is empty that span is
    /// zero and the estimate is reported as `0.0`.
    pub fn estimate(&self, aggregate: CountAggregate) -> RateSnapshot {
        let sum = aggregate.sum as f64;
        let rate_interval = self.rate_interval_secs as f64;
        let bucket_interval = self.bucket_interval_secs as f64;

        let factor = rate_interval - aggregate.number_of_empty_buckets as f64 * bucket_interval;
        let average_rate_excluding_empty_buckets = if factor != 0.0 { sum / factor } else { 0.0 };

        RateSnapshot {
            average_rate: sum / rate_interval,
            average_rate_excluding_empty_buckets,
            peak_rate: aggregate.peak_count as f64 / bucket_interval,
            latest_bucket_rate: aggregate.latest_bucket_count as f64 / bucket_interval,
            aggregate,
        }
    }
}
