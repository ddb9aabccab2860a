//! 防重复提交
//!
//! 记录只在下游接受提交之后写入；存储故障时按"未提交"处理

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guard_common::{SharedClock, redact_ip};
use guard_config::SubmissionConfig;
use guard_ports::KvStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DONE_PREFIX: &str = "done";
const CLAIM_PREFIX: &str = "claim";

/// 组合标识：有指纹时为 `{ip}#{fingerprint}`，否则只用 IP
pub fn generate_identifier(ip: &str, fingerprint: Option<&str>) -> String {
    match fingerprint.map(str::trim).filter(|fp| !fp.is_empty()) {
        Some(fp) => format!("{}#{}", ip, fp),
        None => ip.to_string(),
    }
}

/// 提交记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// 提交状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionStatus {
    pub has_submitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl SubmissionStatus {
    pub fn not_submitted() -> Self {
        Self {
            has_submitted: false,
            submitted_at: None,
        }
    }
}

/// 处理中占位
///
/// 存储故障时拿到的占位不持有锁（`token` 为空），提交照常继续
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionClaim {
    identifier: String,
    token: Option<String>,
}

impl SubmissionClaim {
    /// 是否真正持有存储中的占位
    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }
}

/// 提交记录跟踪
pub struct SubmissionTracker {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    retention: Duration,
    claim_ttl: Duration,
}

impl SubmissionTracker {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock, config: &SubmissionConfig) -> Self {
        Self {
            store,
            clock,
            retention: Duration::from_secs(config.retention_days * 24 * 60 * 60),
            claim_ttl: Duration::from_secs(config.claim_ttl_secs),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn done_key(identifier: &str) -> String {
        format!("{}:{}", DONE_PREFIX, identifier)
    }

    fn claim_key(identifier: &str) -> String {
        format!("{}:{}", CLAIM_PREFIX, identifier)
    }

    /// 查询是否已提交，过期记录读到即删除
    pub async fn check(&self, identifier: &str) -> SubmissionStatus {
        let key = Self::done_key(identifier);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return SubmissionStatus::not_submitted(),
            Err(e) => {
                warn!(error = %e, "Submission lookup failed, treating as not submitted");
                return SubmissionStatus::not_submitted();
            }
        };

        let record: SubmissionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable submission record");
                self.discard(&key, &raw).await;
                return SubmissionStatus::not_submitted();
            }
        };

        if self.clock.now() >= record.expires_at {
            debug!(client = %redact_ip(&record.ip), "Submission record expired");
            self.discard(&key, &raw).await;
            return SubmissionStatus::not_submitted();
        }

        SubmissionStatus {
            has_submitted: true,
            submitted_at: Some(record.submitted_at),
        }
    }

    async fn discard(&self, key: &str, raw: &str) {
        if let Err(e) = self.store.delete_if_equals(key, raw).await {
            warn!(error = %e, "Failed to purge submission record");
        }
    }

    /// 写入提交记录，只能在下游接受之后调用
    pub async fn record(&self, identifier: &str, ip: &str, fingerprint: Option<&str>) -> SubmissionRecord {
        let now = self.clock.now();
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let record = SubmissionRecord {
            submitted_at: now,
            expires_at: now + retention,
            ip: ip.to_string(),
            fingerprint: fingerprint.map(str::to_string),
        };

        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self.store.set(&Self::done_key(identifier), &json, self.retention).await {
                    warn!(error = %e, "Failed to persist submission record");
                } else {
                    info!(client = %redact_ip(ip), expires_at = %record.expires_at, "Submission recorded");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode submission record"),
        }

        record
    }

    /// 占住标识，防止同一客户端并发提交；已被占用返回 None，存储故障不阻塞提交
    pub async fn try_claim(&self, identifier: &str) -> Option<SubmissionClaim> {
        let token = Uuid::new_v4().to_string();

        match self
            .store
            .set_nx(&Self::claim_key(identifier), &token, self.claim_ttl)
            .await
        {
            Ok(true) => Some(SubmissionClaim {
                identifier: identifier.to_string(),
                token: Some(token),
            }),
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, "Submission claim failed, continuing without a claim");
                Some(SubmissionClaim {
                    identifier: identifier.to_string(),
                    token: None,
                })
            }
        }
    }

    /// 释放占位，只删除自己持有的
    pub async fn release_claim(&self, claim: SubmissionClaim) {
        let Some(token) = claim.token else {
            return;
        };

        match self
            .store
            .delete_if_equals(&Self::claim_key(&claim.identifier), &token)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Submission claim already expired"),
            Err(e) => warn!(error = %e, "Failed to release submission claim"),
        }
    }
}
