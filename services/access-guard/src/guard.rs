//! 访问守卫
//!
//! 对 HTTP 层暴露的入口：签发验证码、校验验证码、限流、提交问卷

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use guard_common::{SharedClock, redact_email, redact_ip, system_clock};
use guard_config::GuardConfig;
use guard_errors::{AppError, AppResult};
use guard_ports::{EmailSender, SurveyWorkflow};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::ClientIdentity;
use crate::maintenance::{purge_all, spawn_cleanup};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::store::GuardStores;
use crate::submission::SubmissionTracker;
use crate::verification::{
    CodeIssued, VerificationCodeManager, VerificationSettings, VerifyResult, code_email_body,
    generate_code, normalize,
};

/// 验证码邮件标题
pub const CODE_EMAIL_SUBJECT: &str = "Your survey verification code";

/// 签发结果与邮件发送任务
///
/// 发送失败不会回滚已保存的验证码
#[derive(Debug)]
pub struct CodeDispatch {
    pub issued: CodeIssued,
    pub delivery: JoinHandle<AppResult<()>>,
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// 下游已接收
    Accepted {
        #[serde(rename = "submittedAt")]
        submitted_at: DateTime<Utc>,
    },
    /// 该客户端已提交过
    Duplicate {
        #[serde(rename = "submittedAt", default, skip_serializing_if = "Option::is_none")]
        submitted_at: Option<DateTime<Utc>>,
    },
    /// 同一客户端的另一次提交正在处理
    InFlight,
}

/// 访问守卫
pub struct AccessGuard {
    stores: GuardStores,
    clock: SharedClock,
    codes: VerificationCodeManager,
    limiter: RateLimiter,
    submissions: SubmissionTracker,
    mailer: Arc<dyn EmailSender>,
    workflow: Arc<dyn SurveyWorkflow>,
    cleanup_interval: Duration,
}

impl AccessGuard {
    pub fn new(
        stores: GuardStores,
        config: &GuardConfig,
        clock: SharedClock,
        mailer: Arc<dyn EmailSender>,
        workflow: Arc<dyn SurveyWorkflow>,
    ) -> Self {
        let codes = VerificationCodeManager::new(
            stores.verification.clone(),
            clock.clone(),
            VerificationSettings::from_config(&config.verification),
        );
        let limiter = RateLimiter::from_config(stores.rate_limit.clone(), clock.clone(), &config.rate_limit);
        let submissions =
            SubmissionTracker::new(stores.submission.clone(), clock.clone(), &config.submission);

        Self {
            stores,
            clock,
            codes,
            limiter,
            submissions,
            mailer,
            workflow,
            cleanup_interval: config.cleanup_interval(),
        }
    }

    /// 按配置连接存储，使用系统时钟
    pub async fn connect(
        config: &GuardConfig,
        mailer: Arc<dyn EmailSender>,
        workflow: Arc<dyn SurveyWorkflow>,
    ) -> Self {
        let clock = system_clock();
        let stores = GuardStores::connect(config, clock.clone()).await;
        Self::new(stores, config, clock, mailer, workflow)
    }

    pub fn codes(&self) -> &VerificationCodeManager {
        &self.codes
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn submissions(&self) -> &SubmissionTracker {
        &self.submissions
    }

    /// 签发验证码：语法校验 -> 域名校验 -> 生成 -> 保存 -> 异步发信
    pub async fn request_code(&self, email: &str) -> AppResult<CodeDispatch> {
        let email = normalize(email);

        if !EmailAddress::is_valid(&email) {
            return Err(AppError::validation("Invalid email address"));
        }

        if !self.codes.is_allowed_domain(&email) {
            warn!(email = %redact_email(&email), "Code requested for disallowed domain");
            return Err(AppError::forbidden(format!(
                "Only @{} addresses may request a code",
                self.codes.settings().allowed_domain
            )));
        }

        let code = generate_code(self.codes.settings().code_length)?;
        let issued = self.codes.save_code(&email, &code).await?;

        let body = code_email_body(&code, self.codes.settings().ttl);
        let mailer = Arc::clone(&self.mailer);
        let delivery = tokio::spawn(async move {
            let result = mailer.send_text_email(&email, CODE_EMAIL_SUBJECT, &body).await;
            if let Err(e) = &result {
                counter!("guard_email_delivery_failures_total").increment(1);
                error!(email = %redact_email(&email), error = %e, "Failed to deliver verification code");
            }
            result
        });

        Ok(CodeDispatch { issued, delivery })
    }

    /// 校验验证码，格式不符直接拒绝
    pub async fn verify_code(&self, email: &str, code: &str) -> AppResult<VerifyResult> {
        let expected_len = self.codes.settings().code_length;

        if code.len() != expected_len || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::validation(format!(
                "Code must be exactly {} digits",
                expected_len
            )));
        }

        if !EmailAddress::is_valid(&normalize(email)) {
            return Err(AppError::validation("Invalid email address"));
        }

        Ok(self.codes.verify_code(email, code).await)
    }

    /// 按命名策略限流
    pub async fn check_rate(&self, client: &ClientIdentity, policy: &str) -> RateLimitDecision {
        self.limiter.check(&client.ip, policy).await
    }

    /// 提交问卷：查重 -> 占位 -> 转发下游 -> 成功后记录 -> 释放占位
    pub async fn submit(
        &self,
        client: &ClientIdentity,
        payload: &serde_json::Value,
    ) -> AppResult<SubmissionOutcome> {
        let identifier = client.submission_identifier();

        let status = self.submissions.check(&identifier).await;
        if status.has_submitted {
            counter!("guard_submissions_total", "outcome" => "duplicate").increment(1);
            warn!(client = %redact_ip(&client.ip), "Duplicate submission rejected");
            return Ok(SubmissionOutcome::Duplicate {
                submitted_at: status.submitted_at,
            });
        }

        let Some(claim) = self.submissions.try_claim(&identifier).await else {
            counter!("guard_submissions_total", "outcome" => "in_flight").increment(1);
            warn!(client = %redact_ip(&client.ip), "Submission already in flight");
            return Ok(SubmissionOutcome::InFlight);
        };

        // 占位期间另一个请求可能刚完成
        let status = self.submissions.check(&identifier).await;
        if status.has_submitted {
            self.submissions.release_claim(claim).await;
            counter!("guard_submissions_total", "outcome" => "duplicate").increment(1);
            return Ok(SubmissionOutcome::Duplicate {
                submitted_at: status.submitted_at,
            });
        }

        let forwarded = self.workflow.forward(payload).await;

        let outcome = match forwarded {
            Ok(()) => {
                let record = self
                    .submissions
                    .record(&identifier, &client.ip, client.fingerprint.as_deref())
                    .await;
                counter!("guard_submissions_total", "outcome" => "accepted").increment(1);
                info!(client = %redact_ip(&client.ip), "Submission accepted");
                Ok(SubmissionOutcome::Accepted {
                    submitted_at: record.submitted_at,
                })
            }
            Err(e) => {
                counter!("guard_submissions_total", "outcome" => "failed").increment(1);
                error!(client = %redact_ip(&client.ip), error = %e, "Workflow rejected submission");
                Err(AppError::external_service(format!("Submission was not accepted: {}", e)))
            }
        };

        self.submissions.release_claim(claim).await;
        outcome
    }

    /// 清理所有本地降级存储中的过期条目
    pub async fn purge_expired(&self) -> usize {
        purge_all(&self.stores.fallbacks()).await
    }

    /// 按 `fallback.cleanup_interval_secs` 启动定期清理任务
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_cleanup(self.stores.fallbacks(), self.cleanup_interval, shutdown)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
