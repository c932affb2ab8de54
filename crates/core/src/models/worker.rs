use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker节点信息
///
/// 一个Worker是一个逻辑执行槽位，同一时刻最多承载一个任务，
/// 背后由外部的浏览器自动化实例提供实际执行能力。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Worker状态
///
/// 不变式: `status == Busy` 当且仅当 `current_task` 非空。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "OFFLINE")]
    Offline,
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
}

impl WorkerInfo {
    /// 创建新的Worker信息，初始状态为空闲
    pub fn new(registration: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: registration.worker_id,
            hostname: registration.hostname,
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_completed: 0,
            tasks_successful: 0,
            tasks_failed: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// 检查Worker是否可以接受新任务
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// 分配任务，Worker进入忙碌状态
    pub fn assign_task(&mut self, task_id: &str) {
        self.status = WorkerStatus::Busy;
        self.current_task = Some(task_id.to_string());
    }

    /// 释放当前任务，Worker回到空闲状态
    pub fn release(&mut self) {
        self.status = WorkerStatus::Idle;
        self.current_task = None;
    }

    /// 记录一次任务结果
    pub fn record_outcome(&mut self, success: bool) {
        self.tasks_completed += 1;
        if success {
            self.tasks_successful += 1;
        } else {
            self.tasks_failed += 1;
        }
    }

    /// 更新心跳时间
    pub fn update_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, timeout_ms: u64, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_milliseconds() > timeout_ms as i64
    }
}
