//! Upstream request routing.
//!
//! This crate holds the pieces of the request router that decide what happens after an upstream attempt fails: the
//! per-request [retry engine][retry::RetryEngine], the per-cluster [retry budgets and statistics][cluster], and the
//! [runtime feature flags][runtime] that can switch retries off globally.
#![deny(missing_docs)]

pub mod cluster;
pub mod retry;
pub mod runtime;
