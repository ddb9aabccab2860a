//! 邮箱验证码
//!
//! 每个规范化邮箱最多一个有效验证码，只存哈希。状态流转：
//! 不存在 -> 待验证(attempts=k) -> 已使用 / 已过期 / 次数耗尽，终态都会删除条目。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use guard_common::{SharedClock, hash_prefix, redact_email};
use guard_config::VerificationConfig;
use guard_errors::{AppError, AppResult};
use guard_ports::KvStore;
use metrics::counter;
use rand::Rng;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// 验证码最大长度（u64 可表示）
pub const MAX_CODE_LENGTH: usize = 18;

/// 存储 TTL 比条目有效期多保留的时间，过期后仍能区分 expired 与 not_found
const EXPIRY_GRACE: Duration = Duration::from_secs(60);

/// 规范化邮箱：去首尾空白并转小写
pub fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 生成 `length` 位数字验证码，取值均匀分布于 `[10^(length-1), 10^length - 1]`
pub fn generate_code(length: usize) -> AppResult<String> {
    if !(1..=MAX_CODE_LENGTH).contains(&length) {
        return Err(AppError::validation(format!(
            "Code length must be between 1 and {}, got {}",
            MAX_CODE_LENGTH, length
        )));
    }

    let low = 10u64.pow(length as u32 - 1);
    let high = 10u64.pow(length as u32) - 1;
    let code = rand::thread_rng().gen_range(low..=high);

    Ok(format!("{:0width$}", code, width = length))
}

/// 验证码条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationEntry {
    /// 验证码哈希
    pub code_hash: String,
    /// 过期时间（到达即失效）
    pub expires_at: DateTime<Utc>,
    /// 已失败次数
    pub attempts: u32,
}

/// 验证失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyFailure {
    NotFound,
    Expired,
    AttemptsExceeded,
    Invalid,
}

impl VerifyFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AttemptsExceeded => "attempts_exceeded",
            Self::Invalid => "invalid",
        }
    }
}

/// 验证结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerifyFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_left: Option<u32>,
}

impl VerifyResult {
    pub fn verified() -> Self {
        Self {
            ok: true,
            reason: None,
            attempts_left: None,
        }
    }

    pub fn failed(reason: VerifyFailure) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            attempts_left: None,
        }
    }

    pub fn invalid(attempts_left: u32) -> Self {
        Self {
            ok: false,
            reason: Some(VerifyFailure::Invalid),
            attempts_left: Some(attempts_left),
        }
    }

    fn outcome(&self) -> &'static str {
        self.reason.map(|r| r.as_str()).unwrap_or("verified")
    }
}

/// 签发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeIssued {
    /// 有效期（毫秒）
    pub ttl_ms: u64,
    /// 允许的尝试次数
    pub attempts: u32,
}

/// 验证码设置
#[derive(Debug)]
pub struct VerificationSettings {
    pub allowed_domain: String,
    pub code_length: usize,
    pub ttl: Duration,
    pub max_attempts: u32,
    pub pepper: Option<Secret<String>>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self::from_config(&VerificationConfig::default())
    }
}

impl VerificationSettings {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            allowed_domain: normalize(&config.allowed_domain),
            code_length: config.code_length,
            ttl: Duration::from_secs(config.ttl_secs),
            max_attempts: config.max_attempts,
            pepper: config
                .code_pepper
                .as_ref()
                .map(|p| Secret::new(p.expose_secret().clone())),
        }
    }

    pub fn with_allowed_domain(mut self, domain: &str) -> Self {
        self.allowed_domain = normalize(domain);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// 验证码管理器
pub struct VerificationCodeManager {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    settings: VerificationSettings,
}

impl VerificationCodeManager {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock, settings: VerificationSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    /// 邮箱域名是否为配置的允许域名（大小写不敏感）
    pub fn is_allowed_domain(&self, email: &str) -> bool {
        normalize(email)
            .rsplit_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain == self.settings.allowed_domain)
    }

    /// 计算验证码哈希
    fn hash_code(&self, code: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(pepper) = &self.settings.pepper {
            hasher.update(pepper.expose_secret().as_bytes());
        }
        hasher.update(code.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// 保存验证码，覆盖该邮箱之前的验证码
    pub async fn save_code(&self, email: &str, code: &str) -> AppResult<CodeIssued> {
        let key = normalize(email);
        let ttl = ChronoDuration::from_std(self.settings.ttl)
            .map_err(|e| AppError::internal(format!("Invalid code ttl: {}", e)))?;

        let entry = VerificationEntry {
            code_hash: self.hash_code(code),
            expires_at: self.clock.now() + ttl,
            attempts: 0,
        };

        let json = serde_json::to_string(&entry)?;
        self.store
            .set(&key, &json, self.settings.ttl + EXPIRY_GRACE)
            .await?;

        counter!("guard_codes_issued_total").increment(1);
        info!(
            email = %redact_email(&key),
            code_hash = %hash_prefix(&entry.code_hash),
            expires_at = %entry.expires_at,
            "Verification code saved"
        );

        Ok(CodeIssued {
            ttl_ms: self.settings.ttl.as_millis() as u64,
            attempts: self.settings.max_attempts,
        })
    }

    /// 校验验证码
    pub async fn verify_code(&self, email: &str, code: &str) -> VerifyResult {
        let key = normalize(email);

        let result = match self.try_verify(&key, code).await {
            Ok(result) => result,
            Err(e) => {
                warn!(email = %redact_email(&key), error = %e, "Verification lookup failed");
                VerifyResult::failed(VerifyFailure::NotFound)
            }
        };

        counter!("guard_code_verifications_total", "outcome" => result.outcome()).increment(1);
        debug!(
            email = %redact_email(&key),
            outcome = result.outcome(),
            attempts_left = ?result.attempts_left,
            "Verification code checked"
        );

        result
    }

    async fn try_verify(&self, key: &str, code: &str) -> AppResult<VerifyResult> {
        let presented = self.hash_code(code);
        let max_attempts = self.settings.max_attempts;

        // 条目被并发修改时重新读取再判断；条目最多变化 max_attempts + 1 次
        for _ in 0..max_attempts as usize + 2 {
            let Some(raw) = self.store.get(key).await? else {
                return Ok(VerifyResult::failed(VerifyFailure::NotFound));
            };

            let entry: VerificationEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(email = %redact_email(key), error = %e, "Discarding undecodable verification entry");
                    self.store.delete_if_equals(key, &raw).await?;
                    return Ok(VerifyResult::failed(VerifyFailure::NotFound));
                }
            };

            let now = self.clock.now();

            if now >= entry.expires_at {
                self.store.delete_if_equals(key, &raw).await?;
                return Ok(VerifyResult::failed(VerifyFailure::Expired));
            }

            if entry.attempts >= max_attempts {
                self.store.delete_if_equals(key, &raw).await?;
                warn!(email = %redact_email(key), "Verification attempts exhausted");
                return Ok(VerifyResult::failed(VerifyFailure::AttemptsExceeded));
            }

            if entry.code_hash == presented {
                // 一次性：只有删除成功的请求算验证通过
                if self.store.delete_if_equals(key, &raw).await? {
                    info!(email = %redact_email(key), "Verification code consumed");
                    return Ok(VerifyResult::verified());
                }
                continue;
            }

            let attempts = entry.attempts + 1;
            let remaining_ttl = (entry.expires_at - now).to_std().unwrap_or(Duration::ZERO) + EXPIRY_GRACE;
            let updated = VerificationEntry { attempts, ..entry };

            if self
                .store
                .compare_and_set(key, &raw, &serde_json::to_string(&updated)?, remaining_ttl)
                .await?
            {
                return Ok(VerifyResult::invalid(max_attempts.saturating_sub(attempts)));
            }
        }

        warn!(email = %redact_email(key), "Verification entry under contention, giving up");
        Ok(VerifyResult::failed(VerifyFailure::NotFound))
    }
}

/// 验证码邮件正文
pub fn code_email_body(code: &str, ttl: Duration) -> String {
    let minutes = ttl.as_secs().div_ceil(60).max(1);
    format!(
        "Your verification code is {}.\n\nThe code expires in {} minute(s). If you did not request it, you can ignore this email.",
        code, minutes
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_adapter_local::LocalKvStore;
    use guard_common::ManualClock;

    fn manager() -> (VerificationCodeManager, Arc<LocalKvStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(LocalKvStore::in_memory(clock.clone()));
        let manager = VerificationCodeManager::new(
            store.clone(),
            clock,
            VerificationSettings::default().with_allowed_domain("Example.EDU"),
        );
        (manager, store)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Alice@Example.EDU "), "alice@example.edu");
    }

    #[test]
    fn test_generate_code_rejects_bad_length() {
        assert!(generate_code(0).is_err());
        assert!(generate_code(MAX_CODE_LENGTH + 1).is_err());
        assert_eq!(generate_code(1).unwrap().len(), 1);
        assert_eq!(generate_code(MAX_CODE_LENGTH).unwrap().len(), MAX_CODE_LENGTH);
    }

    #[test]
    fn test_domain_gate_ignores_case_and_subdomains() {
        let (manager, _) = manager();

        assert!(manager.is_allowed_domain("user@example.edu"));
        assert!(manager.is_allowed_domain(" USER@EXAMPLE.EDU "));
        assert!(!manager.is_allowed_domain("user@other.com"));
        assert!(!manager.is_allowed_domain("user@mail.example.edu"));
        assert!(!manager.is_allowed_domain("@example.edu"));
        assert!(!manager.is_allowed_domain("example.edu"));
    }

    #[test]
    fn test_hash_is_stable_and_peppered() {
        let (manager, _) = manager();
        assert_eq!(manager.hash_code("123456"), manager.hash_code("123456"));
        assert_ne!(manager.hash_code("123456"), manager.hash_code("123457"));

        let peppered = VerificationCodeManager::new(
            Arc::new(LocalKvStore::in_memory(Arc::new(ManualClock::starting_now()))),
            Arc::new(ManualClock::starting_now()),
            VerificationSettings {
                pepper: Some(Secret::new("pepper".to_string())),
                ..VerificationSettings::default()
            },
        );
        assert_ne!(manager.hash_code("123456"), peppered.hash_code("123456"));
    }

    #[tokio::test]
    async fn test_plaintext_code_is_never_stored() {
        let (manager, store) = manager();

        manager.save_code("alice@example.edu", "482913").await.unwrap();

        let raw = store.get("alice@example.edu").await.unwrap().unwrap();
        assert!(!raw.contains("482913"));
        let entry: VerificationEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.code_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_undecodable_entry_reads_as_not_found() {
        let (manager, store) = manager();
        store
            .set("alice@example.edu", "garbage", Duration::from_secs(60))
            .await
            .unwrap();

        let result = manager.verify_code("alice@example.edu", "123456").await;

        assert_eq!(result, VerifyResult::failed(VerifyFailure::NotFound));
        assert!(store.get("alice@example.edu").await.unwrap().is_none());
    }

    #[test]
    fn test_verify_result_wire_format() {
        let json = serde_json::to_value(VerifyResult::invalid(2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ok": false, "reason": "invalid", "attemptsLeft": 2})
        );

        let json = serde_json::to_value(VerifyResult::verified()).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true}));

        let json = serde_json::to_value(VerifyResult::failed(VerifyFailure::AttemptsExceeded)).unwrap();
        assert_eq!(json["reason"], "attempts_exceeded");
    }

    #[test]
    fn test_code_email_body_mentions_expiry() {
        let body = code_email_body("123456", Duration::from_secs(300));
        assert!(body.contains("123456"));
        assert!(body.contains("5 minute"));
    }
}
