//! Worker健康监控
//!
//! 跟踪每个Worker在性能窗口内的成功/失败与耗时记录，结合心跳
//! 新鲜度计算健康评分，并对不健康的Worker发起有上限的自动恢复。
//! 监控器只依赖自身状态，不反向查询调度器。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use provisioner_core::{Clock, EventBus, HealthMonitorConfig, OrchestrationEvent};

/// 健康评分低于该值视为不健康
const UNHEALTHY_SCORE_THRESHOLD: f64 = 60.0;
/// 健康评分不低于该值视为健康
const HEALTHY_SCORE_THRESHOLD: f64 = 80.0;
/// 连续失败的扣分上限
const MAX_STREAK_PENALTY: f64 = 50.0;
/// 心跳过期的固定扣分
const STALE_HEARTBEAT_PENALTY: f64 = 30.0;

/// Worker健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Recovering,
}

/// Worker性能指标，按需从窗口历史推导
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPerformanceMetrics {
    pub worker_id: String,
    pub success_rate: f64,
    pub average_task_time_ms: f64,
    pub failure_streak: u32,
    pub health_score: f64,
    pub status: WorkerHealthStatus,
}

/// 一次健康检查的结论
#[derive(Debug, Clone)]
pub struct HealthCheckReport {
    pub worker_id: String,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// 单条任务执行记录
#[derive(Debug, Clone, Copy)]
struct TaskSample {
    at: DateTime<Utc>,
    success: bool,
    duration_ms: u64,
}

/// 每个Worker的私有监控状态
struct WorkerHealthState {
    samples: VecDeque<TaskSample>,
    last_heartbeat: DateTime<Utc>,
    recovery_attempts: u32,
    recovery_in_flight: bool,
}

impl WorkerHealthState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            samples: VecDeque::new(),
            last_heartbeat: now,
            recovery_attempts: 0,
            recovery_in_flight: false,
        }
    }
}

/// Worker健康监控器
pub struct WorkerHealthMonitor {
    config: HealthMonitorConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, WorkerHealthState>>,
}

impl WorkerHealthMonitor {
    pub fn new(config: HealthMonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerHealthState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 开始跟踪一个Worker（注册时调用）
    pub fn track_worker(&self, worker_id: &str) {
        let now = self.clock.now();
        self.lock_states()
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerHealthState::new(now));
    }

    /// 停止跟踪（注销时调用）
    pub fn untrack_worker(&self, worker_id: &str) {
        self.lock_states().remove(worker_id);
    }

    /// 记录一次任务完成
    ///
    /// 任务完成同时视作一次心跳。
    pub fn record_task_completion(&self, worker_id: &str, success: bool, duration_ms: u64) {
        let now = self.clock.now();
        let window = TimeDelta::milliseconds(self.config.performance_window_ms as i64);
        let mut states = self.lock_states();
        let state = states
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerHealthState::new(now));
        state.samples.push_back(TaskSample {
            at: now,
            success,
            duration_ms,
        });
        state.last_heartbeat = now;
        while let Some(front) = state.samples.front() {
            if now - front.at > window {
                state.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 记录一次显式心跳
    pub fn record_heartbeat(&self, worker_id: &str) {
        let now = self.clock.now();
        let mut states = self.lock_states();
        let state = states
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerHealthState::new(now));
        state.last_heartbeat = now;
    }

    /// 计算Worker性能指标
    ///
    /// 纯粹依据窗口内历史与心跳时间推导。空窗口给出乐观默认值，
    /// 新上线的Worker不应一开始就被判不健康。
    pub fn compute_metrics(&self, worker_id: &str) -> WorkerPerformanceMetrics {
        let now = self.clock.now();
        let window = TimeDelta::milliseconds(self.config.performance_window_ms as i64);
        let states = self.lock_states();

        let Some(state) = states.get(worker_id) else {
            return WorkerPerformanceMetrics {
                worker_id: worker_id.to_string(),
                success_rate: 1.0,
                average_task_time_ms: 0.0,
                failure_streak: 0,
                health_score: 100.0,
                status: WorkerHealthStatus::Healthy,
            };
        };

        let samples: Vec<&TaskSample> = state
            .samples
            .iter()
            .filter(|s| now - s.at <= window)
            .collect();

        let success_rate = if samples.is_empty() {
            1.0
        } else {
            samples.iter().filter(|s| s.success).count() as f64 / samples.len() as f64
        };

        let average_task_time_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.duration_ms as f64).sum::<f64>() / samples.len() as f64
        };

        let failure_streak = samples
            .iter()
            .rev()
            .take_while(|s| !s.success)
            .count() as u32;

        let mut health_score = 100.0;
        if success_rate < self.config.min_success_rate {
            health_score -= (self.config.min_success_rate - success_rate) * 100.0;
        }
        health_score -= (failure_streak as f64 * 10.0).min(MAX_STREAK_PENALTY);
        let heartbeat_age_ms = (now - state.last_heartbeat).num_milliseconds();
        if heartbeat_age_ms > self.config.heartbeat_timeout_ms as i64 {
            health_score -= STALE_HEARTBEAT_PENALTY;
        }
        let health_score = health_score.clamp(0.0, 100.0);

        let status = if health_score >= HEALTHY_SCORE_THRESHOLD {
            WorkerHealthStatus::Healthy
        } else if health_score >= UNHEALTHY_SCORE_THRESHOLD {
            WorkerHealthStatus::Degraded
        } else if state.recovery_in_flight {
            WorkerHealthStatus::Recovering
        } else {
            WorkerHealthStatus::Unhealthy
        };

        WorkerPerformanceMetrics {
            worker_id: worker_id.to_string(),
            success_rate,
            average_task_time_ms,
            failure_streak,
            health_score,
            status,
        }
    }

    /// 对单个Worker做健康检查，返回问题与处置建议
    pub fn perform_health_check(&self, worker_id: &str) -> HealthCheckReport {
        let now = self.clock.now();
        let metrics = self.compute_metrics(worker_id);
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        let heartbeat_age_ms = {
            let states = self.lock_states();
            states
                .get(worker_id)
                .map(|s| (now - s.last_heartbeat).num_milliseconds())
                .unwrap_or(0)
        };
        if heartbeat_age_ms > self.config.heartbeat_timeout_ms as i64 {
            issues.push(format!("心跳已停止 {} 秒", heartbeat_age_ms / 1000));
            recommendations.push("检查Worker进程是否存活，必要时重启".to_string());
        }
        if metrics.success_rate < self.config.min_success_rate {
            issues.push(format!(
                "成功率 {:.0}% 低于下限 {:.0}%",
                metrics.success_rate * 100.0,
                self.config.min_success_rate * 100.0
            ));
            recommendations.push("检查该Worker的执行环境与出口线路".to_string());
        }
        if metrics.failure_streak >= self.config.max_failure_streak {
            issues.push(format!("连续失败 {} 次", metrics.failure_streak));
            recommendations.push("建议重启该Worker实例".to_string());
        }

        HealthCheckReport {
            worker_id: worker_id.to_string(),
            issues,
            recommendations,
            checked_at: now,
        }
    }

    /// 监控周期：检查所有被跟踪的Worker，对不健康者发起恢复
    ///
    /// 返回本周期判定为不健康的Worker列表。
    pub async fn run_monitoring_cycle(&self, events: &EventBus) -> Vec<String> {
        let worker_ids: Vec<String> = self.lock_states().keys().cloned().collect();
        let mut unhealthy = Vec::new();

        for worker_id in worker_ids {
            let metrics = self.compute_metrics(&worker_id);
            if metrics.status != WorkerHealthStatus::Unhealthy {
                continue;
            }
            let report = self.perform_health_check(&worker_id);
            warn!(
                "Worker {} 不健康 (评分 {:.0}): {}",
                worker_id,
                metrics.health_score,
                report.issues.join("; ")
            );
            events.publish(OrchestrationEvent::WorkerUnhealthy {
                worker_id: worker_id.clone(),
                issues: report.issues.clone(),
                occurred_at: self.clock.now(),
            });
            self.attempt_recovery(&worker_id, events).await;
            unhealthy.push(worker_id);
        }
        unhealthy
    }

    /// 尝试恢复一个Worker
    ///
    /// 每个Worker的恢复次数有上限，用尽后放弃并保持离线。实际的
    /// 进程重启由外部消费`WorkerRecoveryRequested`事件完成，这里
    /// 只等待恢复延迟后重新评估健康状况。
    pub async fn attempt_recovery(&self, worker_id: &str, events: &EventBus) -> bool {
        let attempt = {
            let mut states = self.lock_states();
            let Some(state) = states.get_mut(worker_id) else {
                debug!("Worker {} 未被跟踪，跳过恢复", worker_id);
                return false;
            };
            if state.recovery_in_flight {
                debug!("Worker {} 已有进行中的恢复，跳过", worker_id);
                return false;
            }
            if state.recovery_attempts >= self.config.recovery_attempts {
                warn!(
                    "Worker {} 的恢复次数已用尽 ({}/{})，保持离线",
                    worker_id, state.recovery_attempts, self.config.recovery_attempts
                );
                return false;
            }
            state.recovery_attempts += 1;
            state.recovery_in_flight = true;
            state.recovery_attempts
        };

        info!(
            "请求恢复Worker {} (第 {}/{} 次)",
            worker_id, attempt, self.config.recovery_attempts
        );
        events.publish(OrchestrationEvent::WorkerRecoveryRequested {
            worker_id: worker_id.to_string(),
            attempt,
            occurred_at: self.clock.now(),
        });

        tokio::time::sleep(self.config.recovery_delay()).await;

        let metrics = self.compute_metrics(worker_id);
        let recovered = metrics.health_score >= UNHEALTHY_SCORE_THRESHOLD;

        {
            let mut states = self.lock_states();
            if let Some(state) = states.get_mut(worker_id) {
                state.recovery_in_flight = false;
                if recovered {
                    state.recovery_attempts = 0;
                }
            }
        }

        if recovered {
            info!("Worker {} 已恢复 (评分 {:.0})", worker_id, metrics.health_score);
            events.publish(OrchestrationEvent::WorkerRecovered {
                worker_id: worker_id.to_string(),
                occurred_at: self.clock.now(),
            });
        } else {
            warn!(
                "Worker {} 第 {} 次恢复失败 (评分 {:.0})",
                worker_id, attempt, metrics.health_score
            );
            events.publish(OrchestrationEvent::WorkerRecoveryFailed {
                worker_id: worker_id.to_string(),
                attempt,
                occurred_at: self.clock.now(),
            });
        }
        recovered
    }
}
