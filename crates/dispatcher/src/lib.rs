//! 调度与限流crate
//!
//! 包含任务编排调度器与进程级限流器。调度器独占任务队列和
//! Worker注册表；限流器是全局唯一闸门，所有派发都必须经过它。

pub mod metrics;
pub mod rate_limiter;
pub mod scheduler;

#[cfg(test)]
mod scheduler_test;
#[cfg(test)]
pub mod test_utils;

pub use rate_limiter::{DenyReason, RateLimitDecision, RateLimitStatus, RateLimiter};
pub use scheduler::ProvisionScheduler;
