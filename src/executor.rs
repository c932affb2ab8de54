//! 模拟执行器与载荷生成器
//!
//! 没有接入真实浏览器自动化环境时，用可配置成功率和延迟区间的
//! 模拟执行器驱动整个调度链路。

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::debug;

use provisioner_core::{
    models::ProvisionTask,
    traits::{ExecutionOutcome, PayloadGenerator, TaskExecutor},
    ProvisionerResult,
};

/// 模拟任务执行器
///
/// 按配置的成功率随机给出结果，执行耗时在延迟区间内均匀取样。
pub struct SimulatedExecutor {
    success_rate: f64,
    min_latency_ms: u64,
    max_latency_ms: u64,
}

impl SimulatedExecutor {
    pub fn new(success_rate: f64, min_latency_ms: u64, max_latency_ms: u64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            min_latency_ms,
            max_latency_ms: max_latency_ms.max(min_latency_ms),
        }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &ProvisionTask) -> ProvisionerResult<ExecutionOutcome> {
        // rng不能跨await持有，先取样再睡眠
        let (succeed, latency_ms) = {
            let mut rng = rand::rng();
            (
                rng.random_bool(self.success_rate),
                rng.random_range(self.min_latency_ms..=self.max_latency_ms),
            )
        };
        debug!("模拟执行任务 {}，预计耗时 {}ms", task.id, latency_ms);
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        if succeed {
            Ok(ExecutionOutcome::success(latency_ms))
        } else {
            Ok(ExecutionOutcome::failure(latency_ms, "账号开通流程被目标站点拦截"))
        }
    }

    fn name(&self) -> &str {
        "simulated-executor"
    }
}

/// 模拟身份资料生成器
pub struct SimulatedPayloadGenerator;

#[async_trait]
impl PayloadGenerator for SimulatedPayloadGenerator {
    async fn generate(&self, batch_id: &str) -> ProvisionerResult<serde_json::Value> {
        let suffix: u32 = rand::rng().random_range(100_000..1_000_000);
        Ok(json!({
            "batch_id": batch_id,
            "username": format!("user_{suffix}"),
            "email": format!("user_{suffix}@example.com"),
            "profile": {
                "locale": "zh-CN",
                "timezone": "Asia/Shanghai",
            },
        }))
    }
}
