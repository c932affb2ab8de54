//! 外部协作者接口定义
//!
//! 编排核心不关心账号实际如何创建，真正的表单填写、指纹配置等
//! 都由外部的浏览器自动化实例完成。核心只依赖这里的两个抽象：
//! 任务执行器和载荷生成器。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ProvisionTask;
use crate::ProvisionerResult;

/// 一次任务执行的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            error: None,
        }
    }

    pub fn failure(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// 任务执行器接口
///
/// 实现方必须保证可安全重试：同一载荷在失败后重新执行是可接受的。
/// 核心没有硬取消机制，执行不能无限挂起，超时仅靠调度器的
/// 超时巡检兜底。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行一个开通任务，返回执行结果
    ///
    /// 执行器内部的失败应尽量通过 `ExecutionOutcome::failure` 返回；
    /// 返回 `Err` 同样会被调度器按失败处理。
    async fn execute(&self, task: &ProvisionTask) -> ProvisionerResult<ExecutionOutcome>;

    /// 执行器名称，用于日志标识
    fn name(&self) -> &str;
}

/// 任务载荷生成器接口
///
/// 为批次中的每个任务提供载荷。生成失败必须阻止任务入队，
/// 绝不允许静默入队空载荷。
#[async_trait]
pub trait PayloadGenerator: Send + Sync {
    async fn generate(&self, batch_id: &str) -> ProvisionerResult<serde_json::Value>;
}
