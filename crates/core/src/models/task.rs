use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 开通任务
///
/// 表示一次账号开通的工作单元，从排队到终态的完整生命周期
/// 都记录在该结构上。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符
/// - `batch_id`: 批次标识，同一次调度产生的任务共享批次
/// - `payload`: 交给外部执行器的不透明载荷，JSON 格式
/// - `assigned_worker`: 当前执行该任务的Worker，仅在执行中有值
/// - `attempts` / `max_attempts`: 已消耗的尝试次数与上限
/// - `status`: 任务状态机的当前状态
/// - `error_message`: 最近一次失败原因，重试期间保留
/// - `scheduled_at`: 最近一次派发时间，用于超时判定，每次派发刷新
/// - `completed_at`: 仅在成功终态时写入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionTask {
    pub id: String,
    pub batch_id: String,
    pub payload: serde_json::Value,
    pub assigned_worker: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: ProvisionTaskStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 任务状态
///
/// 状态机: `Queued → InProgress → {Completed | Queued(重试) | Failed}`。
/// `Completed` 与 `Failed` 为终态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProvisionTaskStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl ProvisionTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl ProvisionTask {
    /// 创建新任务，初始状态为排队
    pub fn new(
        batch_id: &str,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            payload,
            assigned_worker: None,
            attempts: 0,
            max_attempts,
            status: ProvisionTaskStatus::Queued,
            error_message: None,
            created_at: now,
            scheduled_at: None,
            completed_at: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == ProvisionTaskStatus::InProgress
    }

    /// 是否还有剩余的重试预算
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// 派发给Worker执行，刷新超时基准时间
    pub fn mark_dispatched(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = ProvisionTaskStatus::InProgress;
        self.assigned_worker = Some(worker_id.to_string());
        self.scheduled_at = Some(now);
    }

    /// 成功终态
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = ProvisionTaskStatus::Completed;
        self.assigned_worker = None;
        self.completed_at = Some(now);
    }

    /// 记录一次失败，消耗一个尝试名额
    pub fn record_failure(&mut self, error: &str) {
        self.attempts += 1;
        self.error_message = Some(error.to_string());
        self.assigned_worker = None;
    }

    /// 回到排队状态等待重试
    pub fn requeue(&mut self) {
        self.status = ProvisionTaskStatus::Queued;
        self.assigned_worker = None;
        self.scheduled_at = None;
    }

    /// 永久失败终态
    pub fn mark_failed(&mut self) {
        self.status = ProvisionTaskStatus::Failed;
        self.assigned_worker = None;
    }

    /// 判断任务是否已执行超时
    pub fn is_timed_out(&self, timeout_ms: u64, now: DateTime<Utc>) -> bool {
        match (self.status, self.scheduled_at) {
            (ProvisionTaskStatus::InProgress, Some(scheduled_at)) => {
                (now - scheduled_at).num_milliseconds() > timeout_ms as i64
            }
            _ => false,
        }
    }
}
