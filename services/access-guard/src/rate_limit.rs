//! 限流器
//!
//! 每个 (策略, 标识) 一个计数器，不同策略之间互不消耗配额

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guard_common::{SharedClock, redact_ip};
use guard_config::RateLimitConfig;
use guard_ports::KvStore;
use http::{HeaderMap, HeaderName, HeaderValue};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 未知策略名回退到的策略
pub const DEFAULT_POLICY: &str = "default";

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// 限流策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub name: String,
    pub max_requests: u64,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, max_requests: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
        }
    }
}

/// 限流结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// 是否允许
    pub success: bool,
    /// 当前窗口剩余配额
    pub remaining: u64,
    /// 窗口重置时间
    pub reset_time: DateTime<Utc>,
    /// 窗口总配额
    pub limit: u64,
}

impl RateLimitDecision {
    /// 距离窗口重置的时间，已过则为零
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_time - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// 向上取整的重试秒数
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let retry = self.retry_after(now);
        retry.as_secs() + u64::from(retry.subsec_nanos() > 0)
    }

    /// 渲染限流响应头，被拒绝时附带 `Retry-After`
    pub fn headers(&self, now: DateTime<Utc>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(self.limit));
        headers.insert(
            HeaderName::from_static(HEADER_REMAINING),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(HEADER_RESET),
            HeaderValue::from(self.reset_time.timestamp()),
        );

        if !self.success {
            headers.insert(
                http::header::RETRY_AFTER,
                HeaderValue::from(self.retry_after_secs(now)),
            );
        }

        headers
    }
}

/// 限流器
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    policies: BTreeMap<String, RateLimitPolicy>,
    fallback_policy: RateLimitPolicy,
}

impl RateLimiter {
    /// 只带一个 `default` 策略（20 次 / 分钟）
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            policies: BTreeMap::new(),
            fallback_policy: RateLimitPolicy::new(DEFAULT_POLICY, 20, Duration::from_secs(60)),
        }
    }

    /// 按配置加载全部策略
    pub fn from_config(store: Arc<dyn KvStore>, clock: SharedClock, config: &RateLimitConfig) -> Self {
        config
            .policies
            .iter()
            .fold(Self::new(store, clock), |limiter, (name, policy)| {
                limiter.with_policy(RateLimitPolicy::new(
                    name.clone(),
                    policy.max_requests,
                    Duration::from_secs(policy.window_secs),
                ))
            })
    }

    /// 注册策略，同名覆盖
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        if policy.name == DEFAULT_POLICY {
            self.fallback_policy = policy;
        } else {
            self.policies.insert(policy.name.clone(), policy);
        }
        self
    }

    /// 按名称查找策略，未知名称返回 `default`
    pub fn policy(&self, name: &str) -> &RateLimitPolicy {
        self.policies.get(name).unwrap_or(&self.fallback_policy)
    }

    /// 按命名策略检查并消费一次配额
    pub async fn check(&self, identifier: &str, policy: &str) -> RateLimitDecision {
        let policy = self.policy(policy).clone();
        self.check_with(identifier, &policy).await
    }

    /// 按给定策略检查并消费一次配额
    pub async fn check_with(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let key = format!("{}:{}", policy.name, identifier);

        let decision = match self
            .store
            .hit_window(&key, policy.max_requests, policy.window)
            .await
        {
            Ok(hit) => RateLimitDecision {
                success: hit.allowed,
                remaining: hit.remaining,
                reset_time: hit.reset_at,
                limit: policy.max_requests,
            },
            Err(e) => {
                warn!(policy = %policy.name, error = %e, "Rate limit store unavailable, allowing request");
                return self.open_decision(policy);
            }
        };

        if decision.success {
            debug!(
                policy = %policy.name,
                client = %redact_ip(identifier),
                remaining = decision.remaining,
                "Rate limit check passed"
            );
        } else {
            counter!("guard_rate_limit_rejections_total", "policy" => policy.name.clone()).increment(1);
            warn!(
                policy = %policy.name,
                client = %redact_ip(identifier),
                reset_time = %decision.reset_time,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// 存储完全不可用时放行
    fn open_decision(&self, policy: &RateLimitPolicy) -> RateLimitDecision {
        let window = chrono::Duration::from_std(policy.window).unwrap_or(chrono::Duration::zero());
        RateLimitDecision {
            success: true,
            remaining: policy.max_requests,
            reset_time: self.clock.now() + window,
            limit: policy.max_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn decision(success: bool, reset_secs: i64) -> RateLimitDecision {
        RateLimitDecision {
            success,
            remaining: 0,
            reset_time: Utc.timestamp_opt(1_700_000_000 + reset_secs, 0).unwrap(),
            limit: 5,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let d = decision(false, 30);
        let now = now() + chrono::Duration::milliseconds(500);

        assert_eq!(d.retry_after(now), Duration::from_millis(29_500));
        assert_eq!(d.retry_after_secs(now), 30);
    }

    #[test]
    fn test_retry_after_is_zero_once_window_passed() {
        let d = decision(false, 30);
        let later = now() + chrono::Duration::seconds(45);

        assert_eq!(d.retry_after(later), Duration::ZERO);
        assert_eq!(d.retry_after_secs(later), 0);
    }

    #[test]
    fn test_headers_on_rejection() {
        let headers = decision(false, 12).headers(now());

        assert_eq!(headers[HEADER_LIMIT], "5");
        assert_eq!(headers[HEADER_REMAINING], "0");
        assert_eq!(headers[HEADER_RESET], "1700000012");
        assert_eq!(headers[http::header::RETRY_AFTER], "12");
    }

    #[test]
    fn test_headers_on_success_omit_retry_after() {
        let headers = decision(true, 12).headers(now());
        assert!(!headers.contains_key(http::header::RETRY_AFTER));
    }

    #[test]
    fn test_decision_wire_format() {
        let json = serde_json::to_value(decision(true, 0)).unwrap();
        assert!(json.get("resetTime").is_some());
        assert_eq!(json["success"], true);
    }
}
