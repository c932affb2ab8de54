//! 应用配置
//!
//! 配置从TOML文件加载，任意缺省字段回退到默认值。所有时间
//! 字段统一用毫秒表示，加载后通过`validate`做一致性检查。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ProvisionerError, ProvisionerResult};

/// 应用总配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub health: HealthMonitorConfig,
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 调度tick周期（毫秒）
    pub tick_interval_ms: u64,
    /// 健康巡检周期（毫秒）
    pub health_check_interval_ms: u64,
    /// 最大并发任务数
    pub max_concurrent_tasks: usize,
    /// 单任务最大尝试次数
    pub max_attempts: u32,
    /// 重试基础延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 任务执行超时（毫秒）
    pub task_timeout_ms: u64,
    /// Worker心跳超时（毫秒），巡检时按失效处理
    pub worker_heartbeat_timeout_ms: u64,
    /// 事件通道容量
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,          // 每秒一次调度tick
            health_check_interval_ms: 30_000, // 30秒一次巡检
            max_concurrent_tasks: 3,
            max_attempts: 3,
            retry_delay_ms: 30_000,
            task_timeout_ms: 300_000,           // 5分钟
            worker_heartbeat_timeout_ms: 90_000, // 90秒
            event_channel_capacity: 256,
        }
    }
}

/// 限流器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// 每日创建上限
    pub daily_limit: u32,
    /// 每小时创建上限
    pub hourly_limit: u32,
    /// 两次创建之间的最小间隔（毫秒）
    pub min_delay_ms: u64,
    /// 自适应间隔的上限（毫秒）
    pub max_delay_ms: u64,
    /// 冷却时长（毫秒）
    pub cooldown_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            daily_limit: 50,
            hourly_limit: 8,
            min_delay_ms: 120_000,     // 2分钟
            max_delay_ms: 600_000,     // 10分钟
            cooldown_ms: 1_800_000,    // 30分钟
        }
    }
}

/// Worker健康监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// 性能统计窗口（毫秒）
    pub performance_window_ms: u64,
    /// 心跳超时（毫秒）
    pub heartbeat_timeout_ms: u64,
    /// 最低可接受成功率
    pub min_success_rate: f64,
    /// 触发告警的连续失败次数
    pub max_failure_streak: u32,
    /// 每个Worker的自动恢复次数上限
    pub recovery_attempts: u32,
    /// 恢复尝试后的等待时间（毫秒）
    pub recovery_delay_ms: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            performance_window_ms: 1_800_000, // 30分钟
            heartbeat_timeout_ms: 90_000,     // 90秒
            min_success_rate: 0.7,
            max_failure_streak: 5,
            recovery_attempts: 3,
            recovery_delay_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl HealthMonitorConfig {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// `path`为None时使用全部默认值。
    pub fn load(path: Option<&str>) -> ProvisionerResult<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(Path::new(path)).map_err(|e| {
                    ProvisionerError::Configuration(format!("读取配置文件 {path} 失败: {e}"))
                })?;
                toml::from_str(&content).map_err(|e| {
                    ProvisionerError::Configuration(format!("解析配置文件 {path} 失败: {e}"))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> ProvisionerResult<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ProvisionerError::Configuration(
                "tick_interval_ms 必须大于0".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ProvisionerError::Configuration(
                "max_concurrent_tasks 必须大于0".to_string(),
            ));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(ProvisionerError::Configuration(
                "max_attempts 必须大于0".to_string(),
            ));
        }
        if self.rate_limiter.min_delay_ms > self.rate_limiter.max_delay_ms {
            return Err(ProvisionerError::Configuration(
                "min_delay_ms 不能大于 max_delay_ms".to_string(),
            ));
        }
        if self.rate_limiter.daily_limit == 0 || self.rate_limiter.hourly_limit == 0 {
            return Err(ProvisionerError::Configuration(
                "daily_limit 和 hourly_limit 必须大于0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(ProvisionerError::Configuration(
                "min_success_rate 必须在 [0, 1] 范围内".to_string(),
            ));
        }
        Ok(())
    }
}
