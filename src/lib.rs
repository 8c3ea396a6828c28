//! Quota Guard - Distributed Rate Limiting
//!
//! This crate enforces per-identity request quotas over a time window. State
//! lives in a shared Redis counter store, so any number of stateless service
//! instances agree on one global rate per caller. Two algorithms are
//! available: a precise sliding window and an approximate leaky bucket.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod sweeper;
pub mod telemetry;
