//! Sliding-window rate measurement.

mod clock;
mod engine;
mod estimator;
mod key;

pub use clock::BucketClock;
pub use engine::RateLimitEngine;
pub use estimator::{CountAggregate, Estimator, RateSnapshot, ThroughputEstimator};
pub use key::KeyBuilder;
