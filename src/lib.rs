//! RateGate - Admission Control Service
//!
//! This crate decides whether an API call made with a given key against a
//! given endpoint is admitted. Each tenant's policy picks one of two
//! algorithms: an in-process token bucket or a sliding window log kept in a
//! shared usage log.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod time;
