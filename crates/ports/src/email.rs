//! 邮件发送 trait 定义

use async_trait::async_trait;
use guard_errors::AppResult;

/// 邮件发送接口
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// 发送纯文本邮件
    async fn send_text_email(&self, to: &str, subject: &str, body: &str) -> AppResult<()>;
}
