use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use tokio::sync::mpsc::Receiver;

use provisioner_core::{
    models::{ProvisionTaskStatus, WorkerRegistration, WorkerStatus},
    traits::{ExecutionOutcome, PayloadGenerator, TaskExecutor},
    EventBus, HealthMonitorConfig, ManualClock, OrchestrationEvent, ProvisionerError,
    RateLimiterConfig, SchedulerConfig,
};
use provisioner_worker::WorkerHealthMonitor;

use crate::rate_limiter::RateLimiter;
use crate::scheduler::ProvisionScheduler;
use crate::test_utils::{
    FailingPayloadGenerator, PendingExecutor, ScriptedExecutor, StaticExecutor,
    StaticPayloadGenerator,
};

fn permissive_limiter() -> RateLimiterConfig {
    RateLimiterConfig {
        daily_limit: 100_000,
        hourly_limit: 100_000,
        min_delay_ms: 0,
        max_delay_ms: 0,
        cooldown_ms: 1_800_000,
    }
}

fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 1000,
        health_check_interval_ms: 30_000,
        max_concurrent_tasks: 3,
        max_attempts: 3,
        retry_delay_ms: 0,
        task_timeout_ms: 60_000,
        worker_heartbeat_timeout_ms: 3_600_000,
        event_channel_capacity: 256,
    }
}

struct Harness {
    scheduler: Arc<ProvisionScheduler>,
    clock: Arc<ManualClock>,
    rx: Receiver<OrchestrationEvent>,
}

fn build(
    executor: Arc<dyn TaskExecutor>,
    scheduler_config: SchedulerConfig,
    limiter_config: RateLimiterConfig,
) -> Harness {
    build_with_generator(executor, Arc::new(StaticPayloadGenerator), scheduler_config, limiter_config)
}

fn build_with_generator(
    executor: Arc<dyn TaskExecutor>,
    generator: Arc<dyn PayloadGenerator>,
    scheduler_config: SchedulerConfig,
    limiter_config: RateLimiterConfig,
) -> Harness {
    let start = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let rate_limiter = Arc::new(RateLimiter::new(limiter_config, clock.clone()));
    let health_monitor = Arc::new(WorkerHealthMonitor::new(
        HealthMonitorConfig::default(),
        clock.clone(),
    ));
    let (events, rx) = EventBus::channel(scheduler_config.event_channel_capacity);
    let scheduler = Arc::new(ProvisionScheduler::new(
        scheduler_config,
        executor,
        generator,
        rate_limiter,
        health_monitor,
        events,
        clock.clone(),
    ));
    Harness {
        scheduler,
        clock,
        rx,
    }
}

fn registration(worker_id: &str) -> WorkerRegistration {
    WorkerRegistration {
        worker_id: worker_id.to_string(),
        hostname: format!("browser-node-{worker_id}"),
    }
}

fn drain_events(rx: &mut Receiver<OrchestrationEvent>) -> Vec<OrchestrationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// 等待所有已派发的任务处理完毕（派发在独立任务中异步完成）
async fn wait_until_idle(scheduler: &ProvisionScheduler) {
    for _ in 0..400 {
        if scheduler.system_status().await.in_progress_tasks == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("进行中的任务未在预期时间内结束");
}

#[tokio::test]
async fn test_daily_limit_leaves_third_task_queued() {
    // 日限额2，3个任务全部会成功，但第3个被限额挡下
    let mut limiter = permissive_limiter();
    limiter.daily_limit = 2;
    let mut harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        test_scheduler_config(),
        limiter,
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();

    let task_ids = harness.scheduler.schedule_batch(3).await.unwrap();
    assert_eq!(task_ids.len(), 3);

    assert_eq!(harness.scheduler.tick().await, 1);
    wait_until_idle(&harness.scheduler).await;
    assert_eq!(harness.scheduler.tick().await, 1);
    wait_until_idle(&harness.scheduler).await;
    // 第三个tick被每日限额拒绝
    assert_eq!(harness.scheduler.tick().await, 0);

    let status = harness.scheduler.system_status().await;
    assert_eq!(status.completed_tasks, 2);
    assert_eq!(status.queued_tasks, 1);
    assert_eq!(status.failed_tasks, 0);

    let completed = drain_events(&mut harness.rx)
        .into_iter()
        .filter(|e| matches!(e, OrchestrationEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_retries_exhaust_into_permanent_failure() {
    // 执行器永远失败，3次尝试后任务永久失败
    let mut harness = build(
        Arc::new(StaticExecutor::failing(10)),
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();

    let task_ids = harness.scheduler.schedule_batch(1).await.unwrap();
    let task_id = &task_ids[0];

    for _ in 0..3 {
        assert_eq!(harness.scheduler.tick().await, 1);
        wait_until_idle(&harness.scheduler).await;
    }
    // 尝试次数耗尽后不再派发
    assert_eq!(harness.scheduler.tick().await, 0);

    let task = harness.scheduler.task(task_id).await.unwrap();
    assert_eq!(task.status, ProvisionTaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.error_message.is_some());

    let events = drain_events(&mut harness.rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::TaskFailed { attempts: 3, .. })));
}

#[tokio::test]
async fn test_worker_failure_requeues_in_progress_task() {
    // 任务执行中Worker被判失效，任务必须回到队列
    let executor = Arc::new(PendingExecutor::new(true));
    let started = executor.started.clone();
    let release = executor.release.clone();
    let mut harness = build(
        executor,
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    let task_ids = harness.scheduler.schedule_batch(1).await.unwrap();
    let task_id = task_ids[0].clone();

    assert_eq!(harness.scheduler.tick().await, 1);
    started.notified().await;

    let worker = harness.scheduler.worker("w1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_task.as_deref(), Some(task_id.as_str()));

    harness.scheduler.handle_worker_failure("w1").await;

    let task = harness.scheduler.task(&task_id).await.unwrap();
    assert_eq!(task.status, ProvisionTaskStatus::Queued);
    assert!(task.assigned_worker.is_none());
    // 重新排队不消耗尝试次数
    assert_eq!(task.attempts, 0);

    let worker = harness.scheduler.worker("w1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);
    assert!(worker.current_task.is_none());

    let events = drain_events(&mut harness.rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::WorkerFailed { reassigned: 1, .. })));

    // 迟到的执行结果必须被忽略
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = harness.scheduler.task(&task_id).await.unwrap();
    assert_eq!(task.status, ProvisionTaskStatus::Queued);
}

#[tokio::test]
async fn test_timeout_sweep_fails_task_and_worker() {
    let executor = Arc::new(PendingExecutor::new(true));
    let started = executor.started.clone();
    let release = executor.release.clone();
    let mut harness = build(
        executor,
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    let task_id = harness.scheduler.schedule_batch(1).await.unwrap()[0].clone();

    assert_eq!(harness.scheduler.tick().await, 1);
    started.notified().await;

    // 超过任务超时后巡检介入
    harness.clock.advance(TimeDelta::seconds(61));
    harness.scheduler.monitor_progress().await;

    let task = harness.scheduler.task(&task_id).await.unwrap();
    // 超时按失败处理，消耗一次尝试
    assert_eq!(task.status, ProvisionTaskStatus::Queued);
    assert_eq!(task.attempts, 1);
    assert_eq!(
        task.error_message,
        Some(ProvisionerError::ExecutionTimeout.to_string())
    );

    let worker = harness.scheduler.worker("w1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);

    let events = drain_events(&mut harness.rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::WorkerFailed { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::SystemHealthUpdate { .. })));

    // 迟到的成功结果不会推翻超时判定
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = harness.scheduler.task(&task_id).await.unwrap();
    assert_eq!(task.status, ProvisionTaskStatus::Queued);
    assert_eq!(task.attempts, 1);
}

#[tokio::test]
async fn test_hung_executor_does_not_stall_control_loop() {
    // 执行器永远不返回，tick与巡检也不能被拖住
    let executor = Arc::new(PendingExecutor::new(true));
    let started = executor.started.clone();
    let mut harness = build(
        executor,
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    harness
        .scheduler
        .register_worker(registration("w2"))
        .await
        .unwrap();
    harness.scheduler.schedule_batch(2).await.unwrap();

    assert_eq!(harness.scheduler.tick().await, 1);
    started.notified().await;

    // 第一个执行器仍挂起，第二个任务照样被派发到空闲Worker
    assert_eq!(harness.scheduler.tick().await, 1);
    let status = harness.scheduler.system_status().await;
    assert_eq!(status.in_progress_tasks, 2);

    // 超时巡检同样不被挂起的执行器阻塞，把两个任务都回收
    harness.clock.advance(TimeDelta::seconds(61));
    harness.scheduler.monitor_progress().await;

    let status = harness.scheduler.system_status().await;
    assert_eq!(status.in_progress_tasks, 0);
    assert_eq!(status.queued_tasks, 2);
    assert_eq!(
        harness.scheduler.worker("w1").await.unwrap().status,
        WorkerStatus::Offline
    );
    assert_eq!(
        harness.scheduler.worker("w2").await.unwrap().status,
        WorkerStatus::Offline
    );

    let events = drain_events(&mut harness.rx);
    let failed_workers = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::WorkerFailed { .. }))
        .count();
    assert_eq!(failed_workers, 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::SystemHealthUpdate { .. })));
}

#[tokio::test]
async fn test_least_loaded_worker_is_preferred() {
    let mut harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    harness
        .scheduler
        .register_worker(registration("w2"))
        .await
        .unwrap();

    harness.scheduler.schedule_batch(2).await.unwrap();
    assert_eq!(harness.scheduler.tick().await, 1);
    wait_until_idle(&harness.scheduler).await;
    assert_eq!(harness.scheduler.tick().await, 1);
    wait_until_idle(&harness.scheduler).await;

    // 两个Worker各分到一个任务（完成数最少者优先）
    let w1 = harness.scheduler.worker("w1").await.unwrap();
    let w2 = harness.scheduler.worker("w2").await.unwrap();
    assert_eq!(w1.tasks_completed, 1);
    assert_eq!(w2.tasks_completed, 1);
    drain_events(&mut harness.rx);
}

#[tokio::test]
async fn test_pause_blocks_dispatch_until_resume() {
    let mut harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    harness.scheduler.schedule_batch(1).await.unwrap();

    harness.scheduler.pause_operations().await;
    assert_eq!(harness.scheduler.tick().await, 0);
    assert!(harness.scheduler.system_status().await.paused);

    harness.scheduler.resume_operations().await;
    assert_eq!(harness.scheduler.tick().await, 1);
    wait_until_idle(&harness.scheduler).await;
    drain_events(&mut harness.rx);
}

#[tokio::test]
async fn test_payload_generator_failure_creates_no_tasks() {
    let harness = build_with_generator(
        Arc::new(StaticExecutor::succeeding(0)),
        Arc::new(FailingPayloadGenerator),
        test_scheduler_config(),
        permissive_limiter(),
    );

    let result = harness.scheduler.schedule_batch(2).await;
    assert!(matches!(
        result,
        Err(ProvisionerError::PayloadGeneration(_))
    ));
    // 失败的批次不留下半截任务
    assert_eq!(harness.scheduler.system_status().await.total_tasks(), 0);
}

#[tokio::test]
async fn test_task_conservation_across_mixed_outcomes() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        ExecutionOutcome::failure(10, "验证步骤失败"),
        ExecutionOutcome::success(10),
        ExecutionOutcome::failure(10, "代理不可用"),
        ExecutionOutcome::failure(10, "代理不可用"),
        ExecutionOutcome::failure(10, "代理不可用"),
    ]));
    let mut harness = build(executor, test_scheduler_config(), permissive_limiter());
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    harness.scheduler.schedule_batch(3).await.unwrap();

    // 任何时刻四种状态的总和都等于调度过的任务数
    for _ in 0..10 {
        harness.scheduler.tick().await;
        wait_until_idle(&harness.scheduler).await;
        assert_eq!(harness.scheduler.system_status().await.total_tasks(), 3);
    }

    let status = harness.scheduler.system_status().await;
    assert_eq!(status.completed_tasks + status.failed_tasks + status.queued_tasks, 3);
    assert_eq!(status.in_progress_tasks, 0);
    drain_events(&mut harness.rx);
}

#[tokio::test]
async fn test_unregister_busy_worker_is_rejected() {
    let executor = Arc::new(PendingExecutor::new(true));
    let started = executor.started.clone();
    let release = executor.release.clone();
    let harness = build(executor, test_scheduler_config(), permissive_limiter());
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    harness.scheduler.schedule_batch(1).await.unwrap();

    assert_eq!(harness.scheduler.tick().await, 1);
    started.notified().await;

    assert!(matches!(
        harness.scheduler.unregister_worker("w1").await,
        Err(ProvisionerError::WorkerBusy { .. })
    ));

    release.notify_one();
    wait_until_idle(&harness.scheduler).await;
    assert!(harness.scheduler.unregister_worker("w1").await.is_ok());
}

#[tokio::test]
async fn test_heartbeat_revives_offline_worker() {
    let harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();

    harness.scheduler.handle_worker_failure("w1").await;
    assert_eq!(
        harness.scheduler.worker("w1").await.unwrap().status,
        WorkerStatus::Offline
    );

    // 心跳代表外部重启完成
    harness.scheduler.update_worker_heartbeat("w1").await.unwrap();
    assert_eq!(
        harness.scheduler.worker("w1").await.unwrap().status,
        WorkerStatus::Idle
    );
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();
    assert!(harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_no_dispatch_without_workers() {
    let harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        test_scheduler_config(),
        permissive_limiter(),
    );
    harness.scheduler.schedule_batch(1).await.unwrap();
    assert_eq!(harness.scheduler.tick().await, 0);
    assert_eq!(harness.scheduler.system_status().await.queued_tasks, 1);
}

#[tokio::test]
async fn test_stale_heartbeat_sweep_marks_worker_failed() {
    let mut config = test_scheduler_config();
    config.worker_heartbeat_timeout_ms = 90_000;
    let mut harness = build(
        Arc::new(StaticExecutor::succeeding(0)),
        config,
        permissive_limiter(),
    );
    harness
        .scheduler
        .register_worker(registration("w1"))
        .await
        .unwrap();

    harness.clock.advance(TimeDelta::seconds(120));
    harness.scheduler.monitor_progress().await;

    assert_eq!(
        harness.scheduler.worker("w1").await.unwrap().status,
        WorkerStatus::Offline
    );
    let events = drain_events(&mut harness.rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::WorkerFailed { reassigned: 0, .. })));
}
