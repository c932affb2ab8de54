//! Worker健康监控crate
//!
//! 独立于调度器之外跟踪每个Worker的表现，对外提供健康指标
//! 计算、健康检查与有上限的自动恢复。

pub mod health_monitor;


pub use health_monitor::{
    HealthCheckReport, WorkerHealthMonitor, WorkerHealthStatus, WorkerPerformanceMetrics,
};
