//! Politeness and failure handling shared by every network call site.

pub mod block;
pub mod proxy;
pub mod retry;
pub mod throttle;

pub use block::{BlockDetector, BlockVerdict};
pub use proxy::{ProxyChain, ProxyEndpoint};
pub use retry::{CaptchaBackoff, Gated, RetryPolicy};
pub use throttle::{RateLimiter, ThrottlePolicy};
