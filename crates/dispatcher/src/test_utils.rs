//! 调度器测试用的执行器/生成器替身

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use provisioner_core::{
    models::ProvisionTask,
    traits::{ExecutionOutcome, PayloadGenerator, TaskExecutor},
    ProvisionerError, ProvisionerResult,
};

/// 固定结果的执行器
pub struct StaticExecutor {
    succeed: bool,
    duration_ms: u64,
}

impl StaticExecutor {
    pub fn succeeding(duration_ms: u64) -> Self {
        Self {
            succeed: true,
            duration_ms,
        }
    }

    pub fn failing(duration_ms: u64) -> Self {
        Self {
            succeed: false,
            duration_ms,
        }
    }
}

#[async_trait]
impl TaskExecutor for StaticExecutor {
    async fn execute(&self, _task: &ProvisionTask) -> ProvisionerResult<ExecutionOutcome> {
        if self.succeed {
            Ok(ExecutionOutcome::success(self.duration_ms))
        } else {
            Ok(ExecutionOutcome::failure(self.duration_ms, "模拟失败"))
        }
    }

    fn name(&self) -> &str {
        "static-executor"
    }
}

/// 按脚本顺序给出结果的执行器，脚本耗尽后一律成功
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, _task: &ProvisionTask) -> ProvisionerResult<ExecutionOutcome> {
        let next = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| ExecutionOutcome::success(10)))
    }

    fn name(&self) -> &str {
        "scripted-executor"
    }
}

/// 挂起的执行器：`execute`开始后通知`started`，直到`release`才返回
///
/// 用于制造任务长时间处于进行中的场景（超时巡检、Worker失效）。
pub struct PendingExecutor {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
    succeed_on_release: bool,
}

impl PendingExecutor {
    pub fn new(succeed_on_release: bool) -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            succeed_on_release,
        }
    }
}

#[async_trait]
impl TaskExecutor for PendingExecutor {
    async fn execute(&self, _task: &ProvisionTask) -> ProvisionerResult<ExecutionOutcome> {
        self.started.notify_one();
        self.release.notified().await;
        if self.succeed_on_release {
            Ok(ExecutionOutcome::success(100))
        } else {
            Ok(ExecutionOutcome::failure(100, "释放后失败"))
        }
    }

    fn name(&self) -> &str {
        "pending-executor"
    }
}

/// 固定载荷生成器
pub struct StaticPayloadGenerator;

#[async_trait]
impl PayloadGenerator for StaticPayloadGenerator {
    async fn generate(&self, batch_id: &str) -> ProvisionerResult<serde_json::Value> {
        Ok(json!({ "batch": batch_id, "profile": "default" }))
    }
}

/// 始终失败的载荷生成器
pub struct FailingPayloadGenerator;

#[async_trait]
impl PayloadGenerator for FailingPayloadGenerator {
    async fn generate(&self, _batch_id: &str) -> ProvisionerResult<serde_json::Value> {
        Err(ProvisionerError::PayloadGeneration(
            "身份资料池已耗尽".to_string(),
        ))
    }
}
