//! 自适应限流器
//!
//! 所有创建动作在派发前都必须经过这里的闸门。限流器维护
//! 日/小时滚动计数、两次创建之间的自适应间隔、近一小时的
//! 成功率滑动窗口以及冷却状态，并根据观测到的成功率调整节奏。
//! 进程内只应存在一个实例，任何组件都不得绕过它直接派发。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use provisioner_core::{Clock, ProvisionerError, ProvisionerResult, RateLimiterConfig};

/// 成功率滑动窗口长度
const ATTEMPT_WINDOW: TimeDelta = TimeDelta::minutes(60);
/// 突发统计窗口长度
const BURST_WINDOW: TimeDelta = TimeDelta::minutes(5);
/// 自动冷却的成功率下限
const AUTO_COOLDOWN_SUCCESS_RATE: f64 = 0.3;
/// 自动冷却所需的最少样本数
const AUTO_COOLDOWN_MIN_SAMPLES: usize = 10;
/// 内部评估出错时的安全拒绝等待时间
const SAFE_DENY_WAIT: TimeDelta = TimeDelta::seconds(60);

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenyReason {
    CooldownActive,
    DailyLimit,
    HourlyLimit,
    MinDelayNotElapsed,
    BurstLimit,
    /// 内部评估出错，安全拒绝
    Internal,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CooldownActive => "cooldown_active",
            Self::DailyLimit => "daily_limit",
            Self::HourlyLimit => "hourly_limit",
            Self::MinDelayNotElapsed => "min_delay_not_elapsed",
            Self::BurstLimit => "burst_limit",
            Self::Internal => "internal",
        }
    }
}

/// 闸门判定结果
///
/// 拒绝不是错误而是正常的限流结论，带有原因与建议等待时间。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied { reason: DenyReason, wait: TimeDelta },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: DenyReason, wait: TimeDelta) -> Self {
        Self::Denied {
            reason,
            wait: wait.max(TimeDelta::zero()),
        }
    }
}

/// 限流器状态快照，管理接口用
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub created_today: u32,
    pub created_this_hour: u32,
    pub current_delay_ms: i64,
    pub success_rate: f64,
    pub window_samples: usize,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    at: DateTime<Utc>,
    success: bool,
}

struct LimiterState {
    day_key: NaiveDate,
    hour_key: DateTime<Utc>,
    created_today: u32,
    created_this_hour: u32,
    last_creation: Option<DateTime<Utc>>,
    current_delay: TimeDelta,
    recent_attempts: VecDeque<AttemptRecord>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl LimiterState {
    fn new(config: &RateLimiterConfig, now: DateTime<Utc>) -> Self {
        Self {
            day_key: now.date_naive(),
            hour_key: hour_start(now),
            created_today: 0,
            created_this_hour: 0,
            last_creation: None,
            current_delay: TimeDelta::milliseconds(config.min_delay_ms as i64),
            recent_attempts: VecDeque::new(),
            cooldown_until: None,
        }
    }

    /// 按墙钟的日/小时边界滚动计数器，与流量无关
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day_key {
            info!("跨过日边界，重置每日计数 (原计数 {})", self.created_today);
            self.day_key = today;
            self.created_today = 0;
        }
        let hour = hour_start(now);
        if hour != self.hour_key {
            debug!("跨过小时边界，重置小时计数 (原计数 {})", self.created_this_hour);
            self.hour_key = hour;
            self.created_this_hour = 0;
        }
        while let Some(front) = self.recent_attempts.front() {
            if now - front.at > ATTEMPT_WINDOW {
                self.recent_attempts.pop_front();
            } else {
                break;
            }
        }
    }

    fn success_rate(&self) -> f64 {
        if self.recent_attempts.is_empty() {
            return 1.0;
        }
        let successes = self.recent_attempts.iter().filter(|a| a.success).count();
        successes as f64 / self.recent_attempts.len() as f64
    }
}

fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    // 整小时截断不会失败，失败时退回原值（只影响一次滚动判断）
    now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now)
}

/// 自适应限流器
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let state = LimiterState::new(&config, clock.now());
        Self {
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 突发上限，约为小时限额的四分之一
    fn burst_limit(&self) -> u32 {
        (self.config.hourly_limit / 4).max(1)
    }

    /// 判定当前是否允许发起一次新的创建
    ///
    /// 拒绝永远以`Denied`返回而不是错误；内部出现任何评估故障时
    /// 安全拒绝（固定60秒等待），绝不失败放行。
    pub fn check(&self) -> RateLimitDecision {
        match self.evaluate() {
            Ok(decision) => decision,
            Err(e) => {
                error!("限流评估失败，安全拒绝: {e}");
                RateLimitDecision::denied(DenyReason::Internal, SAFE_DENY_WAIT)
            }
        }
    }

    fn evaluate(&self) -> ProvisionerResult<RateLimitDecision> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.roll_windows(now);

        // 1. 冷却期：到期则清除，否则拒绝
        if let Some(until) = state.cooldown_until {
            if now >= until {
                info!("冷却期已结束");
                state.cooldown_until = None;
            } else {
                return Ok(RateLimitDecision::denied(
                    DenyReason::CooldownActive,
                    until - now,
                ));
            }
        }

        // 2. 每日上限，下一个可用时刻为次日零点
        if state.created_today >= self.config.daily_limit {
            let next_midnight = state
                .day_key
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .ok_or_else(|| {
                    ProvisionerError::Internal("无法计算次日零点".to_string())
                })?;
            return Ok(RateLimitDecision::denied(
                DenyReason::DailyLimit,
                next_midnight - now,
            ));
        }

        // 3. 小时上限，下一个可用时刻为下个整点
        if state.created_this_hour >= self.config.hourly_limit {
            let next_hour = state.hour_key + TimeDelta::hours(1);
            return Ok(RateLimitDecision::denied(
                DenyReason::HourlyLimit,
                next_hour - now,
            ));
        }

        // 4. 最小间隔
        if let Some(last) = state.last_creation {
            let elapsed = now - last;
            if elapsed < state.current_delay {
                return Ok(RateLimitDecision::denied(
                    DenyReason::MinDelayNotElapsed,
                    state.current_delay - elapsed,
                ));
            }
        }

        // 5. 突发限制：5分钟内的尝试数
        let recent_burst = state
            .recent_attempts
            .iter()
            .filter(|a| now - a.at <= BURST_WINDOW)
            .count() as u32;
        if recent_burst >= self.burst_limit() {
            return Ok(RateLimitDecision::denied(DenyReason::BurstLimit, BURST_WINDOW));
        }

        Ok(RateLimitDecision::Allowed)
    }

    /// 当前需要等待的时间，重试节奏计算用
    pub fn required_wait(&self) -> TimeDelta {
        match self.check() {
            RateLimitDecision::Allowed => TimeDelta::zero(),
            RateLimitDecision::Denied { wait, .. } => wait,
        }
    }

    /// 记录一次创建尝试的结果
    ///
    /// 成功与失败同样消耗限额。根据窗口成功率重新计算自适应间隔，
    /// 成功率持续过低时自动进入冷却。
    pub fn record_outcome(&self, success: bool) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.roll_windows(now);

        state.created_today += 1;
        state.created_this_hour += 1;
        state.last_creation = Some(now);
        state.recent_attempts.push_back(AttemptRecord { at: now, success });

        let success_rate = state.success_rate();
        state.current_delay = self.compute_delay(success_rate);
        debug!(
            "记录创建结果 success={} 窗口成功率={:.2} 下次间隔={}ms",
            success,
            success_rate,
            state.current_delay.num_milliseconds()
        );

        if success_rate < AUTO_COOLDOWN_SUCCESS_RATE
            && state.recent_attempts.len() >= AUTO_COOLDOWN_MIN_SAMPLES
            && state.cooldown_until.is_none()
        {
            let until = now + TimeDelta::milliseconds(self.config.cooldown_ms as i64);
            warn!(
                "窗口成功率 {:.0}% 过低 ({} 个样本)，自动进入冷却直到 {}",
                success_rate * 100.0,
                state.recent_attempts.len(),
                until
            );
            state.cooldown_until = Some(until);
        }
    }

    /// 根据成功率分档计算间隔并加随机抖动
    fn compute_delay(&self, success_rate: f64) -> TimeDelta {
        let min = self.config.min_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let factor = if success_rate >= 0.9 {
            0.2
        } else if success_rate >= 0.7 {
            0.5
        } else {
            0.8
        };
        let base = min + factor * (max - min);
        let jitter: f64 = rand::rng().random_range(0.8..=1.2);
        let delay = (base * jitter).clamp(min, max);
        TimeDelta::milliseconds(delay.round() as i64)
    }

    /// 手动触发冷却，时长缺省时使用配置值
    pub fn trigger_cooldown(&self, duration: Option<Duration>) {
        let now = self.clock.now();
        let delta = duration
            .map(|d| TimeDelta::milliseconds(d.as_millis() as i64))
            .unwrap_or_else(|| TimeDelta::milliseconds(self.config.cooldown_ms as i64));
        let until = now + delta;
        warn!("手动触发冷却，直到 {}", until);
        self.lock_state().cooldown_until = Some(until);
    }

    /// 清零所有限流状态（管理操作，幂等）
    pub fn reset_limits(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        *state = LimiterState::new(&self.config, now);
        info!("限流状态已重置");
    }

    /// 当前状态快照
    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.roll_windows(now);
        RateLimitStatus {
            created_today: state.created_today,
            created_this_hour: state.created_this_hour,
            current_delay_ms: state.current_delay.num_milliseconds(),
            success_rate: state.success_rate(),
            window_samples: state.recent_attempts.len(),
            cooldown_until: state.cooldown_until,
        }
    }
}
