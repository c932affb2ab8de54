use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use provisioner_core::{
    models::WorkerRegistration, AppConfig, EventBus, OrchestrationEvent, SystemClock,
};
use provisioner_dispatcher::{ProvisionScheduler, RateLimiter};
use provisioner_worker::WorkerHealthMonitor;

use crate::executor::{SimulatedExecutor, SimulatedPayloadGenerator};

/// 主应用程序
///
/// 负责组装调度器、限流器、健康监控器与模拟执行器，并驱动
/// 调度tick与健康巡检两个周期循环。
pub struct Application {
    config: AppConfig,
    scheduler: Arc<ProvisionScheduler>,
    health_monitor: Arc<WorkerHealthMonitor>,
    events: EventBus,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<OrchestrationEvent>>>,
    worker_count: u32,
    batch_size: usize,
}

impl Application {
    /// 创建应用实例并完成组件装配
    pub fn new(config: AppConfig, worker_count: u32, batch_size: usize) -> Result<Self> {
        let clock = Arc::new(SystemClock);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone(), clock.clone()));
        let health_monitor = Arc::new(WorkerHealthMonitor::new(
            config.health.clone(),
            clock.clone(),
        ));
        let (events, event_rx) = EventBus::channel(config.scheduler.event_channel_capacity);

        // 没有真实浏览器环境时用模拟执行器，成功率85%，延迟2-8秒
        let executor = Arc::new(SimulatedExecutor::new(0.85, 2_000, 8_000));
        let payload_generator = Arc::new(SimulatedPayloadGenerator);

        let scheduler = Arc::new(ProvisionScheduler::new(
            config.scheduler.clone(),
            executor,
            payload_generator,
            rate_limiter,
            health_monitor.clone(),
            events.clone(),
            clock,
        ));

        Ok(Self {
            config,
            scheduler,
            health_monitor,
            events,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            worker_count,
            batch_size,
        })
    }

    /// 运行主循环直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        // 注册模拟Worker
        for i in 1..=self.worker_count {
            let registration = WorkerRegistration {
                worker_id: format!("worker-{i}"),
                hostname: format!("sim-node-{i:02}"),
            };
            self.scheduler.register_worker(registration).await?;
        }
        info!("已注册 {} 个模拟Worker", self.worker_count);

        if self.batch_size > 0 {
            let task_ids = self.scheduler.schedule_batch(self.batch_size).await?;
            info!("初始批次已入队 {} 个任务", task_ids.len());
        }

        // 事件消费循环单独跑
        let event_handle = {
            let rx = self
                .event_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            let Some(rx) = rx else {
                return Err(anyhow::anyhow!("事件接收端已被占用，run只能调用一次"));
            };
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                consume_events(rx, shutdown_rx).await;
            })
        };

        let mut tick_interval = tokio::time::interval(self.config.scheduler.tick_interval());
        let mut health_interval =
            tokio::time::interval(self.config.scheduler.health_check_interval());
        // 第一次tick立即触发，跳过
        tick_interval.tick().await;
        health_interval.tick().await;

        info!(
            "控制循环启动 (tick={}ms, 健康巡检={}ms)",
            self.config.scheduler.tick_interval_ms, self.config.scheduler.health_check_interval_ms
        );

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.scheduler.tick().await;
                }
                _ = health_interval.tick() => {
                    // 进程内模拟Worker始终存活，代为上报心跳
                    for i in 1..=self.worker_count {
                        let worker_id = format!("worker-{i}");
                        if let Err(e) = self.scheduler.update_worker_heartbeat(&worker_id).await {
                            warn!("上报Worker {} 心跳失败: {}", worker_id, e);
                        }
                    }
                    self.scheduler.monitor_progress().await;
                    self.health_monitor.run_monitoring_cycle(&self.events).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("控制循环收到关闭信号");
                    break;
                }
            }
        }

        let status = self.scheduler.system_status().await;
        info!(
            "最终状态: 队列中={} 进行中={} 已完成={} 已失败={}",
            status.queued_tasks,
            status.in_progress_tasks,
            status.completed_tasks,
            status.failed_tasks
        );

        let _ = event_handle.await;
        Ok(())
    }
}

/// 消费编排事件并写入日志
async fn consume_events(
    mut rx: mpsc::Receiver<OrchestrationEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                log_event(&event);
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

fn log_event(event: &OrchestrationEvent) {
    match event {
        OrchestrationEvent::TaskCompleted {
            task_id,
            worker_id,
            duration_ms,
            ..
        } => {
            info!(
                "[事件] 任务 {} 在Worker {} 上完成，耗时 {}ms",
                task_id, worker_id, duration_ms
            );
        }
        OrchestrationEvent::TaskFailed {
            task_id,
            error,
            attempts,
            ..
        } => {
            error!(
                "[事件] 任务 {} 经 {} 次尝试后永久失败: {}",
                task_id, attempts, error
            );
        }
        OrchestrationEvent::WorkerRegistered { worker_id, .. } => {
            info!("[事件] Worker {} 已注册", worker_id);
        }
        OrchestrationEvent::WorkerUnregistered { worker_id, .. } => {
            info!("[事件] Worker {} 已注销", worker_id);
        }
        OrchestrationEvent::WorkerFailed {
            worker_id,
            reassigned,
            ..
        } => {
            warn!(
                "[事件] Worker {} 失效，{} 个任务重新排队",
                worker_id, reassigned
            );
        }
        OrchestrationEvent::WorkerUnhealthy {
            worker_id, issues, ..
        } => {
            warn!("[事件] Worker {} 健康异常: {}", worker_id, issues.join("; "));
        }
        OrchestrationEvent::WorkerRecoveryRequested {
            worker_id, attempt, ..
        } => {
            info!("[事件] Worker {} 第 {} 次恢复尝试开始", worker_id, attempt);
        }
        OrchestrationEvent::WorkerRecovered { worker_id, .. } => {
            info!("[事件] Worker {} 已恢复", worker_id);
        }
        OrchestrationEvent::WorkerRecoveryFailed {
            worker_id, attempt, ..
        } => {
            warn!("[事件] Worker {} 第 {} 次恢复尝试失败", worker_id, attempt);
        }
        OrchestrationEvent::SystemHealthUpdate { status, .. } => {
            info!(
                "[事件] 系统快照: 活跃Worker={} 队列中={} 进行中={} 已完成={} 已失败={}",
                status.active_workers,
                status.queued_tasks,
                status.in_progress_tasks,
                status.completed_tasks,
                status.failed_tasks
            );
        }
    }
}
