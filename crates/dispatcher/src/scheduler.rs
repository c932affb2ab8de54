//! 任务编排调度器
//!
//! 调度器独占任务队列与Worker注册表。每个tick依次经过限流闸门、
//! 空闲Worker选择，然后把任务派发给外部执行器；执行结果回流到
//! 限流器与健康监控器。单个tick最多派发一个任务：吞吐由限流器
//! 的间隔逻辑主导，而不是并行度。对执行器的等待发生在独立的
//! tokio任务中，控制循环（tick与巡检）不会被慢执行器拖住。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use provisioner_core::{
    models::{ProvisionTask, ProvisionTaskStatus, SystemStatus, WorkerInfo, WorkerRegistration},
    traits::{PayloadGenerator, TaskExecutor},
    Clock, EventBus, OrchestrationEvent, ProvisionerError, ProvisionerResult, SchedulerConfig,
};
use provisioner_core::models::WorkerStatus;
use provisioner_worker::WorkerHealthMonitor;

use crate::metrics::SchedulerMetrics;
use crate::rate_limiter::{RateLimitDecision, RateLimiter};

/// 调度器内部可变状态，全部通过单把锁串行访问
struct SchedulerState {
    tasks: HashMap<String, ProvisionTask>,
    pending: VecDeque<String>,
    /// 等待重试的任务及其就绪时刻，到点后插回队首
    retry_backlog: Vec<(String, DateTime<Utc>)>,
    workers: HashMap<String, WorkerInfo>,
    paused: bool,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            pending: VecDeque::new(),
            retry_backlog: Vec::new(),
            workers: HashMap::new(),
            paused: false,
        }
    }

    fn in_progress_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_in_progress()).count()
    }

    /// 到点的重试任务插回队首（重试优先于新任务）
    fn drain_due_retries(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<String> = Vec::new();
        self.retry_backlog.retain(|(task_id, ready_at)| {
            if *ready_at <= now {
                due.push(task_id.clone());
                false
            } else {
                true
            }
        });
        for task_id in due {
            debug!("任务 {} 重试等待结束，插回队首", task_id);
            self.pending.push_front(task_id);
        }
    }

    fn status_snapshot(&self) -> SystemStatus {
        let mut status = SystemStatus {
            active_workers: self
                .workers
                .values()
                .filter(|w| matches!(w.status, WorkerStatus::Idle | WorkerStatus::Busy))
                .count(),
            paused: self.paused,
            ..Default::default()
        };
        for task in self.tasks.values() {
            match task.status {
                ProvisionTaskStatus::Queued => status.queued_tasks += 1,
                ProvisionTaskStatus::InProgress => status.in_progress_tasks += 1,
                ProvisionTaskStatus::Completed => status.completed_tasks += 1,
                ProvisionTaskStatus::Failed => status.failed_tasks += 1,
            }
        }
        status
    }
}

/// 任务编排调度器
///
/// 克隆是廉价的：所有可变状态在同一把共享锁后面，克隆体之间
/// 看到同一份队列与注册表。
#[derive(Clone)]
pub struct ProvisionScheduler {
    config: SchedulerConfig,
    executor: Arc<dyn TaskExecutor>,
    payload_generator: Arc<dyn PayloadGenerator>,
    rate_limiter: Arc<RateLimiter>,
    health_monitor: Arc<WorkerHealthMonitor>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    state: Arc<Mutex<SchedulerState>>,
}

impl ProvisionScheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn TaskExecutor>,
        payload_generator: Arc<dyn PayloadGenerator>,
        rate_limiter: Arc<RateLimiter>,
        health_monitor: Arc<WorkerHealthMonitor>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            executor,
            payload_generator,
            rate_limiter,
            health_monitor,
            events,
            clock,
            metrics: SchedulerMetrics::new(),
            state: Arc::new(Mutex::new(SchedulerState::new())),
        }
    }

    /// 创建一批开通任务，返回生成的任务ID列表
    ///
    /// 载荷先全部生成，任何一个失败都会使整批落空，避免半截批次。
    pub async fn schedule_batch(&self, count: usize) -> ProvisionerResult<Vec<String>> {
        let batch_id = Uuid::new_v4().to_string();
        let mut payloads = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.payload_generator.generate(&batch_id).await?;
            payloads.push(payload);
        }

        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut task_ids = Vec::with_capacity(count);
        for payload in payloads {
            let task = ProvisionTask::new(&batch_id, payload, self.config.max_attempts, now);
            task_ids.push(task.id.clone());
            state.pending.push_back(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }
        info!("批次 {} 已入队 {} 个任务", batch_id, task_ids.len());
        self.metrics.set_queue_depth(state.pending.len());
        Ok(task_ids)
    }

    /// 一次调度tick
    ///
    /// 暂停或队列为空时什么都不做；否则经过限流闸门和Worker选择，
    /// 最多派发一个任务。返回本tick实际派发的任务数。任何单任务
    /// 的问题都被就地吞掉，tick本身从不失败。
    ///
    /// 执行器调用在独立的tokio任务中等待，tick选定任务后立即返回：
    /// 挂起的执行器不能阻塞控制循环，否则超时巡检永远没有机会兜底。
    pub async fn tick(&self) -> usize {
        let dispatch = {
            let mut state = self.state.lock().await;
            if state.paused {
                return 0;
            }
            let now = self.clock.now();
            state.drain_due_retries(now);
            if state.pending.is_empty() {
                return 0;
            }

            match self.rate_limiter.check() {
                RateLimitDecision::Allowed => {}
                RateLimitDecision::Denied { reason, wait } => {
                    debug!(
                        "限流闸门拒绝 ({})，等待 {}s",
                        reason.as_str(),
                        wait.num_seconds()
                    );
                    self.metrics.record_gate_denied();
                    return 0;
                }
            }

            let idle_workers = state.workers.values().filter(|w| w.is_available()).count();
            let capacity = self
                .config
                .max_concurrent_tasks
                .saturating_sub(state.in_progress_count());
            // 一个tick最多派发一个任务，节奏由限流器主导
            let to_dispatch = state.pending.len().min(idle_workers).min(capacity).min(1);
            if to_dispatch == 0 {
                debug!(
                    "本tick不派发 (pending={} idle={} capacity={})",
                    state.pending.len(),
                    idle_workers,
                    capacity
                );
                return 0;
            }

            // 空闲Worker中选完成数最少的（最小负载）
            let worker_id = state
                .workers
                .values()
                .filter(|w| w.is_available())
                .min_by_key(|w| w.tasks_completed)
                .map(|w| w.id.clone());
            let Some(worker_id) = worker_id else {
                return 0;
            };
            let Some(task_id) = state.pending.pop_front() else {
                return 0;
            };
            let Some(task) = state.tasks.get_mut(&task_id) else {
                error!("队列中的任务 {} 在任务表中不存在，跳过", task_id);
                return 0;
            };
            task.mark_dispatched(&worker_id, now);
            let task_snapshot = task.clone();
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.assign_task(&task_id);
            }
            self.metrics.set_queue_depth(state.pending.len());
            (task_snapshot, worker_id)
        };

        let (task, worker_id) = dispatch;
        let this = self.clone();
        tokio::spawn(async move {
            this.dispatch(task, worker_id).await;
        });
        1
    }

    /// 把任务派发给外部执行器并等待结果
    ///
    /// 执行器抛出的错误在这里被拦截并转为失败处理，不会向上冒泡。
    async fn dispatch(&self, task: ProvisionTask, worker_id: String) {
        info!(
            "派发任务 {} (批次 {}, 第 {}/{} 次尝试) 给Worker {}",
            task.id,
            task.batch_id,
            task.attempts + 1,
            task.max_attempts,
            worker_id
        );
        self.metrics.record_dispatch();

        let started = std::time::Instant::now();
        match self.executor.execute(&task).await {
            Ok(outcome) if outcome.success => {
                self.on_success(&task.id, &worker_id, outcome.duration_ms).await;
            }
            Ok(outcome) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "执行器未说明失败原因".to_string());
                self.on_failure(&task.id, &worker_id, &error, outcome.duration_ms)
                    .await;
            }
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.on_failure(&task.id, &worker_id, &e.to_string(), duration_ms)
                    .await;
            }
        }
    }

    /// 执行结果是否仍然有效
    ///
    /// 超时巡检可能已经把任务收走，迟到的执行结果直接忽略，
    /// 避免重复计数。
    async fn outcome_is_current(&self, task_id: &str, worker_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .tasks
            .get(task_id)
            .map(|t| t.is_in_progress() && t.assigned_worker.as_deref() == Some(worker_id))
            .unwrap_or(false)
    }

    async fn on_success(&self, task_id: &str, worker_id: &str, duration_ms: u64) {
        if !self.outcome_is_current(task_id, worker_id).await {
            debug!("任务 {} 的成功结果已过期，忽略", task_id);
            return;
        }
        self.rate_limiter.record_outcome(true);
        self.health_monitor
            .record_task_completion(worker_id, true, duration_ms);

        let now = self.clock.now();
        let event = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            task.mark_completed(now);
            let batch_id = task.batch_id.clone();
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.release();
                worker.record_outcome(true);
                worker.update_heartbeat(now);
            }
            OrchestrationEvent::TaskCompleted {
                task_id: task_id.to_string(),
                batch_id,
                worker_id: worker_id.to_string(),
                duration_ms,
                occurred_at: now,
            }
        };

        info!("任务 {} 完成，耗时 {}ms", task_id, duration_ms);
        self.metrics.record_success(duration_ms);
        self.events.publish(event);
    }

    async fn on_failure(&self, task_id: &str, worker_id: &str, error: &str, duration_ms: u64) {
        if !self.outcome_is_current(task_id, worker_id).await {
            debug!("任务 {} 的失败结果已过期，忽略", task_id);
            return;
        }
        self.rate_limiter.record_outcome(false);
        self.health_monitor
            .record_task_completion(worker_id, false, duration_ms);
        self.metrics.record_failure();

        // 重试等待 = max(配置重试延迟, 限流器要求的等待)
        let retry_delay = TimeDelta::milliseconds(self.config.retry_delay_ms as i64);
        let limiter_wait = self.rate_limiter.required_wait();
        let backoff = retry_delay.max(limiter_wait);

        let now = self.clock.now();
        let event = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            task.record_failure(error);
            let will_retry = task.can_retry();
            let attempts = task.attempts;
            let batch_id = task.batch_id.clone();
            if will_retry {
                task.requeue();
                let ready_at = now + backoff;
                state.retry_backlog.push((task_id.to_string(), ready_at));
                warn!(
                    "任务 {} 第 {} 次尝试失败: {}，{}s 后重试",
                    task_id,
                    attempts,
                    error,
                    backoff.num_seconds()
                );
                self.metrics.record_retry();
            } else {
                task.mark_failed();
                error!(
                    "任务 {} 已达最大尝试次数 {}，永久失败: {}",
                    task_id, attempts, error
                );
            }
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.release();
                worker.record_outcome(false);
                worker.update_heartbeat(now);
            }
            if will_retry {
                None
            } else {
                Some(OrchestrationEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    batch_id,
                    worker_id: worker_id.to_string(),
                    error: error.to_string(),
                    attempts,
                    occurred_at: now,
                })
            }
        };

        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    /// 健康巡检
    ///
    /// 超时的进行中任务按失败处理（消耗一次尝试），其Worker升级到
    /// 失效处理；心跳过期的Worker同样按失效处理。最后发布系统
    /// 健康快照。
    pub async fn monitor_progress(&self) {
        let now = self.clock.now();

        let timed_out: Vec<(String, String, i64)> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.is_timed_out(self.config.task_timeout_ms, now))
                .filter_map(|t| {
                    t.assigned_worker
                        .as_ref()
                        .map(|w| {
                            let elapsed_ms = t
                                .scheduled_at
                                .map(|s| (now - s).num_milliseconds())
                                .unwrap_or(0);
                            (t.id.clone(), w.clone(), elapsed_ms)
                        })
                })
                .collect()
        };

        for (task_id, worker_id, elapsed_ms) in timed_out {
            warn!(
                "任务 {} 在Worker {} 上执行超过 {}ms 未完成，按超时处理",
                task_id, worker_id, elapsed_ms
            );
            let timeout_error = ProvisionerError::ExecutionTimeout.to_string();
            self.on_failure(&task_id, &worker_id, &timeout_error, elapsed_ms as u64)
                .await;
            self.handle_worker_failure(&worker_id).await;
        }

        let stale_workers: Vec<String> = {
            let state = self.state.lock().await;
            state
                .workers
                .values()
                .filter(|w| matches!(w.status, WorkerStatus::Idle | WorkerStatus::Busy))
                .filter(|w| w.is_heartbeat_expired(self.config.worker_heartbeat_timeout_ms, now))
                .map(|w| w.id.clone())
                .collect()
        };
        for worker_id in stale_workers {
            warn!("Worker {} 心跳过期，按失效处理", worker_id);
            self.handle_worker_failure(&worker_id).await;
        }

        let status = self.system_status().await;
        self.metrics.update_system_gauges(&status);
        self.events.publish(OrchestrationEvent::SystemHealthUpdate {
            status,
            occurred_at: now,
        });
    }

    /// 处理失效的Worker
    ///
    /// Worker标记为失效，其承载的进行中任务全部插回队首重新排队
    /// （不消耗尝试次数），随后Worker转为离线等待外部重启。
    pub async fn handle_worker_failure(&self, worker_id: &str) {
        let now = self.clock.now();
        let reassigned = {
            let mut state = self.state.lock().await;
            let Some(worker) = state.workers.get_mut(worker_id) else {
                warn!("收到未知Worker {} 的失效报告，忽略", worker_id);
                return;
            };
            if matches!(worker.status, WorkerStatus::Failed | WorkerStatus::Offline) {
                debug!("Worker {} 已处于失效/离线状态", worker_id);
                return;
            }
            worker.status = WorkerStatus::Failed;
            worker.current_task = None;

            let orphaned: Vec<String> = state
                .tasks
                .values()
                .filter(|t| {
                    t.is_in_progress() && t.assigned_worker.as_deref() == Some(worker_id)
                })
                .map(|t| t.id.clone())
                .collect();
            for task_id in &orphaned {
                if let Some(task) = state.tasks.get_mut(task_id) {
                    task.requeue();
                }
                // 被打断的任务优先于新任务
                state.pending.push_front(task_id.clone());
            }
            orphaned.len()
        };

        warn!(
            "Worker {} 失效，{} 个任务已重新排队",
            worker_id, reassigned
        );
        self.events.publish(OrchestrationEvent::WorkerFailed {
            worker_id: worker_id.to_string(),
            reassigned,
            occurred_at: now,
        });

        // 转为离线，等待外部重启；实际恢复由健康监控周期驱动
        let mut state = self.state.lock().await;
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.status = WorkerStatus::Offline;
            info!("Worker {} 已转为离线，等待外部重启", worker_id);
        }
    }

    /// 注册新Worker，初始状态为空闲
    pub async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> ProvisionerResult<()> {
        let now = self.clock.now();
        let worker_id = registration.worker_id.clone();
        {
            let mut state = self.state.lock().await;
            if state.workers.contains_key(&worker_id) {
                return Err(ProvisionerError::Internal(format!(
                    "Worker {worker_id} 已注册"
                )));
            }
            state
                .workers
                .insert(worker_id.clone(), WorkerInfo::new(registration, now));
        }
        self.health_monitor.track_worker(&worker_id);
        info!("Worker {} 已注册", worker_id);
        self.events.publish(OrchestrationEvent::WorkerRegistered {
            worker_id,
            occurred_at: now,
        });
        Ok(())
    }

    /// 注销Worker
    ///
    /// 仍承载任务的Worker必须先经过失效处理把任务还回队列。
    pub async fn unregister_worker(&self, worker_id: &str) -> ProvisionerResult<()> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            let Some(worker) = state.workers.get(worker_id) else {
                return Err(ProvisionerError::WorkerNotFound {
                    id: worker_id.to_string(),
                });
            };
            if worker.current_task.is_some() {
                return Err(ProvisionerError::WorkerBusy {
                    id: worker_id.to_string(),
                });
            }
            state.workers.remove(worker_id);
        }
        self.health_monitor.untrack_worker(worker_id);
        info!("Worker {} 已注销", worker_id);
        self.events.publish(OrchestrationEvent::WorkerUnregistered {
            worker_id: worker_id.to_string(),
            occurred_at: now,
        });
        Ok(())
    }

    /// 更新Worker心跳
    ///
    /// 失效/离线的Worker发来心跳说明外部重启已完成，重新回到空闲。
    pub async fn update_worker_heartbeat(&self, worker_id: &str) -> ProvisionerResult<()> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return Err(ProvisionerError::WorkerNotFound {
                    id: worker_id.to_string(),
                });
            };
            worker.update_heartbeat(now);
            if matches!(worker.status, WorkerStatus::Failed | WorkerStatus::Offline)
                && worker.current_task.is_none()
            {
                info!("Worker {} 心跳恢复，重新回到空闲", worker_id);
                worker.status = WorkerStatus::Idle;
            }
        }
        self.health_monitor.record_heartbeat(worker_id);
        Ok(())
    }

    /// 暂停派发；进行中的任务照常跑完
    pub async fn pause_operations(&self) {
        let mut state = self.state.lock().await;
        state.paused = true;
        info!("调度已暂停，进行中的任务继续执行");
    }

    /// 恢复派发
    pub async fn resume_operations(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        info!("调度已恢复");
    }

    /// 系统状态快照
    pub async fn system_status(&self) -> SystemStatus {
        self.state.lock().await.status_snapshot()
    }

    /// 查询单个任务（管理接口）
    pub async fn task(&self, task_id: &str) -> Option<ProvisionTask> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }

    /// 查询单个Worker（管理接口）
    pub async fn worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.state.lock().await.workers.get(worker_id).cloned()
    }

    /// 限流器访问（管理接口：状态查询、冷却、重置）
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
