//! Ringrate - Sliding-Window Hit Rate Estimation
//!
//! This crate measures how often each subject (a client IP, an account id)
//! hits an action, across any number of stateless service instances. Counts
//! live in a ring of time buckets inside one shared store, so every instance
//! sees the same window. The engine reports rates; deciding what to do with
//! them is left to the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
