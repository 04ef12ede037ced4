//! Core logic: rate limiting, bandwidth accounting, IP profiles, and scoring.
//!
//! Everything in this module is synchronous and allocation-light; it is
//! shared between the interceptor's hot path and the analyzer's background
//! tasks and must never itself perform I/O or hold a lock across one.

pub mod cache;
pub mod profile;
pub mod sanitize;
pub mod scorer;
pub mod sliding_window;
pub mod stats;
pub mod token_bucket;
pub mod tracker;
