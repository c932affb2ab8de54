use thiserror::Error;

/// 编排核心错误类型定义
#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("Worker {id} 仍有进行中的任务，无法注销")]
    WorkerBusy { id: String },

    #[error("载荷生成失败: {0}")]
    PayloadGeneration(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type ProvisionerResult<T> = std::result::Result<T, ProvisionerError>;
