//! 编排核心的基础类型
//!
//! 本crate定义任务/Worker数据模型、错误类型、配置、事件通道
//! 以及与外部执行器之间的接口抽象，供调度与健康监控crate使用。

pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod time;
pub mod traits;

pub use config::{AppConfig, HealthMonitorConfig, RateLimiterConfig, SchedulerConfig};
pub use errors::{ProvisionerError, ProvisionerResult};
pub use events::{EventBus, OrchestrationEvent};
pub use time::{Clock, ManualClock, SystemClock};
