//! 问卷工作流 trait 定义

use async_trait::async_trait;
use guard_errors::AppResult;

/// 外部工作流服务（持久化问卷答案）
#[async_trait]
pub trait SurveyWorkflow: Send + Sync {
    /// 提交问卷，返回 Ok 表示下游已持久接收
    async fn forward(&self, payload: &serde_json::Value) -> AppResult<()>;
}
