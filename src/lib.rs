//! Fairgate - Distributed Priority-Aware Admission Control
//!
//! This crate decides whether work may proceed against shared, rate-limited
//! buckets. Token state lives in a shared store and is only changed by one
//! atomic evaluate-and-consume operation, so any number of evaluator
//! processes can run side by side. Priority classes sharing a bucket are
//! arbitrated by weight with optional guaranteed floors.

pub mod clock;
pub mod config;
pub mod error;
pub mod limits;
pub mod protocol;
pub mod ratelimit;
pub mod report;
pub mod store;
