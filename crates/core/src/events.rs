//! 编排事件
//!
//! 核心向外部监控/告警系统发布的事件。采用有界通道而不是
//! 观察者回调：发布方永不阻塞控制循环，通道满时丢弃事件并
//! 记录告警。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::SystemStatus;

/// 编排核心发出的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestrationEvent {
    TaskCompleted {
        task_id: String,
        batch_id: String,
        worker_id: String,
        duration_ms: u64,
        occurred_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        batch_id: String,
        worker_id: String,
        error: String,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    },
    WorkerRegistered {
        worker_id: String,
        occurred_at: DateTime<Utc>,
    },
    WorkerUnregistered {
        worker_id: String,
        occurred_at: DateTime<Utc>,
    },
    WorkerFailed {
        worker_id: String,
        reassigned: usize,
        occurred_at: DateTime<Utc>,
    },
    WorkerUnhealthy {
        worker_id: String,
        issues: Vec<String>,
        occurred_at: DateTime<Utc>,
    },
    WorkerRecoveryRequested {
        worker_id: String,
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    WorkerRecovered {
        worker_id: String,
        occurred_at: DateTime<Utc>,
    },
    WorkerRecoveryFailed {
        worker_id: String,
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    SystemHealthUpdate {
        status: SystemStatus,
        occurred_at: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::WorkerRegistered { .. } => "worker_registered",
            Self::WorkerUnregistered { .. } => "worker_unregistered",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::WorkerUnhealthy { .. } => "worker_unhealthy",
            Self::WorkerRecoveryRequested { .. } => "worker_recovery_requested",
            Self::WorkerRecovered { .. } => "worker_recovered",
            Self::WorkerRecoveryFailed { .. } => "worker_recovery_failed",
            Self::SystemHealthUpdate { .. } => "system_health_update",
        }
    }
}

/// 事件总线发送端
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<OrchestrationEvent>,
}

impl EventBus {
    /// 创建事件通道，返回发送端与订阅端
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// 发布事件，通道满时丢弃并告警
    pub fn publish(&self, event: OrchestrationEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(dropped) => {
                    warn!("事件通道已满，丢弃事件: {}", dropped.event_type());
                }
                mpsc::error::TrySendError::Closed(dropped) => {
                    warn!("事件通道已关闭，丢弃事件: {}", dropped.event_type());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let (bus, mut rx) = EventBus::channel(4);
        bus.publish(OrchestrationEvent::WorkerRegistered {
            worker_id: "w1".to_string(),
            occurred_at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "worker_registered");
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (bus, mut rx) = EventBus::channel(1);
        for _ in 0..3 {
            bus.publish(OrchestrationEvent::WorkerRecovered {
                worker_id: "w1".to_string(),
                occurred_at: Utc::now(),
            });
        }
        // 只有第一条被保留，后续被丢弃而非阻塞
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
