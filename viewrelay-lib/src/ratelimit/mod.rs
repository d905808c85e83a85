//! Per-actor admission control over fixed minute, hour and day windows.
//!
//! # Architecture
//!
//! - [`WindowKind`] and [`RateWindow`]: one fixed counting window
//! - [`RateLimiter`]: the three windows of every actor, each actor behind its own lock
//! - [`RateLimitConfig`]: the limits per window

mod config;
mod limiter;
mod window;

pub use config::{
    DEFAULT_RATE_LIMIT_PER_DAY, DEFAULT_RATE_LIMIT_PER_HOUR, DEFAULT_RATE_LIMIT_PER_MINUTE,
    RateLimitConfig,
};
pub use limiter::{Admission, RateLimiter, Usage};
pub use window::{RateWindow, WindowKind};
