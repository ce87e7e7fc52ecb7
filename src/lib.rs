//! Window Throttle - Sliding-Window Admission Control
//!
//! This crate implements a request-path admission controller that throttles
//! clients exceeding a request budget within a rolling time window. Clients
//! are correlated by configurable request attributes; all state lives in one
//! process and is discarded on shutdown.

pub mod adapter;
pub mod config;
pub mod error;
pub mod ratelimit;
