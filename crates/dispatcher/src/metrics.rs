//! 调度指标采集
//!
//! 基于`metrics` facade暴露派发/失败/重试计数与队列深度等指标，
//! 由外部决定是否安装导出器。

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

use provisioner_core::models::SystemStatus;

#[derive(Clone)]
pub struct SchedulerMetrics {
    dispatches_total: Counter,
    successes_total: Counter,
    failures_total: Counter,
    retries_total: Counter,
    gate_denials_total: Counter,
    task_duration_seconds: Histogram,
    queue_depth: Gauge,
    in_progress_tasks: Gauge,
    active_workers: Gauge,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            dispatches_total: counter!("provisioner_dispatches_total"),
            successes_total: counter!("provisioner_task_successes_total"),
            failures_total: counter!("provisioner_task_failures_total"),
            retries_total: counter!("provisioner_task_retries_total"),
            gate_denials_total: counter!("provisioner_gate_denials_total"),
            task_duration_seconds: histogram!("provisioner_task_duration_seconds"),
            queue_depth: gauge!("provisioner_queue_depth"),
            in_progress_tasks: gauge!("provisioner_in_progress_tasks"),
            active_workers: gauge!("provisioner_active_workers"),
        }
    }

    pub fn record_dispatch(&self) {
        self.dispatches_total.increment(1);
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.successes_total.increment(1);
        self.task_duration_seconds.record(duration_ms as f64 / 1000.0);
    }

    pub fn record_failure(&self) {
        self.failures_total.increment(1);
    }

    pub fn record_retry(&self) {
        self.retries_total.increment(1);
    }

    pub fn record_gate_denied(&self) {
        self.gate_denials_total.increment(1);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn update_system_gauges(&self, status: &SystemStatus) {
        self.queue_depth.set(status.queued_tasks as f64);
        self.in_progress_tasks.set(status.in_progress_tasks as f64);
        self.active_workers.set(status.active_workers as f64);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
