pub mod task;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use task::{ProvisionTask, ProvisionTaskStatus};
pub use worker::{WorkerInfo, WorkerRegistration, WorkerStatus};

/// 系统状态快照，管理接口用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub paused: bool,
}

impl SystemStatus {
    /// 曾经调度过的任务总数（守恒检查用）
    pub fn total_tasks(&self) -> usize {
        self.queued_tasks + self.in_progress_tasks + self.completed_tasks + self.failed_tasks
    }
}
