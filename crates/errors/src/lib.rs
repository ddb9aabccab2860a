//! guard-errors - 统一错误处理
//!
//! 基于 RFC 7807 Problem Details 规范。预期内的结果（验证失败、限流、重复提交）
//! 不走错误通道，这里只有输入错误和协作方故障。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 输入格式错误
    #[error("Validation error: {0}")]
    Validation(String),

    /// 输入合法但不被允许（如邮箱域名）
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// 键值存储故障
    #[error("Storage error: {0}")]
    Storage(String),

    /// 邮件、工作流等下游故障
    #[error("External service error: {0}")]
    ExternalService(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn external_service(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Forbidden(_) => 403,
            Self::Internal(_) | Self::Storage(_) => 500,
            Self::ExternalService(_) => 502,
        }
    }

    /// 是否为调用方输入导致的错误
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// 转换为 Problem Details
    ///
    /// 服务端错误只给出标题，不暴露内部细节
    pub fn to_problem_details(&self) -> ProblemDetails {
        let detail = if self.is_client_error() {
            self.to_string()
        } else {
            self.title().to_string()
        };

        ProblemDetails {
            r#type: format!("https://survey-guard.dev/problems/{}", self.slug()),
            title: self.title().to_string(),
            status: self.status_code(),
            detail,
            instance: None,
        }
    }

    fn slug(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::Internal(_) => "internal",
            Self::Storage(_) => "storage",
            Self::ExternalService(_) => "external-service",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation Error",
            Self::Forbidden(_) => "Forbidden",
            Self::Internal(_) => "Internal Server Error",
            Self::Storage(_) => "Storage Error",
            Self::ExternalService(_) => "External Service Error",
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization failed: {}", err))
    }
}

/// RFC 7807 Problem Details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;
