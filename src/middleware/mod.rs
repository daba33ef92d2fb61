//! Middleware for the observability surface and the request pipeline.
//!
//! This module provides:
//! - Request logging with latency tracking for the HTTP listener
//! - Rate limiting per caller identity

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{ConsumeResult, RateLimitConfig, RateLimiter};
