//! guard-config - 配置加载库

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Redis 配置（主存储，可选）
#[derive(Debug, Deserialize)]
pub struct RedisConfig {
    pub url: Secret<String>,
    /// 单次调用超时（毫秒），超时按存储故障处理
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    1500
}

fn default_key_prefix() -> String {
    "survey".to_string()
}

/// 验证码配置
#[derive(Debug, Deserialize)]
pub struct VerificationConfig {
    /// 允许申请验证码的邮箱域名
    #[serde(default = "default_allowed_domain")]
    pub allowed_domain: String,
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    #[serde(default = "default_code_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 哈希前缀密钥
    #[serde(default)]
    pub code_pepper: Option<Secret<String>>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            allowed_domain: default_allowed_domain(),
            code_length: default_code_length(),
            ttl_secs: default_code_ttl_secs(),
            max_attempts: default_max_attempts(),
            code_pepper: None,
        }
    }
}

fn default_allowed_domain() -> String {
    "example.edu".to_string()
}

fn default_code_length() -> usize {
    6
}

fn default_code_ttl_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

/// 单个限流策略
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl PolicyConfig {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }
}

/// 限流配置
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
        }
    }
}

fn default_policies() -> BTreeMap<String, PolicyConfig> {
    BTreeMap::from([
        ("code".to_string(), PolicyConfig::new(5, 60)),
        ("verify".to_string(), PolicyConfig::new(10, 60)),
        ("submit".to_string(), PolicyConfig::new(3, 60)),
        ("questions".to_string(), PolicyConfig::new(10, 60)),
        ("default".to_string(), PolicyConfig::new(20, 60)),
    ])
}

/// 重复提交配置
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// 提交进行中占位的有效期
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            claim_ttl_secs: default_claim_ttl_secs(),
        }
    }
}

fn default_retention_days() -> u64 {
    30
}

fn default_claim_ttl_secs() -> u64 {
    30
}

/// 本地降级存储配置
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_verification_file")]
    pub verification_file: PathBuf,
    #[serde(default)]
    pub submission_file: Option<PathBuf>,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            verification_file: default_verification_file(),
            submission_file: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_verification_file() -> PathBuf {
    PathBuf::from("target/.cache/verification-codes.json")
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 应用配置
#[derive(Debug, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_app_name() -> String {
    "survey-guard".to_string()
}

fn default_app_env() -> String {
    "development".to_string()
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_env: default_app_env(),
            redis: None,
            verification: VerificationConfig::default(),
            rate_limit: RateLimitConfig::default(),
            submission: SubmissionConfig::default(),
            fallback: FallbackConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl GuardConfig {
    /// 配置来源：默认文件、环境文件、`GUARD_` 前缀的环境变量
    pub fn figment(config_dir: &str) -> Figment {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("GUARD_").split("__"))
    }

    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(config_dir))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let verification = &self.verification;
        if verification.code_length == 0 || verification.code_length > 18 {
            return Err(ConfigError::Invalid(format!(
                "verification.code_length must be between 1 and 18, got {}",
                verification.code_length
            )));
        }
        if verification.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "verification.max_attempts must be at least 1".to_string(),
            ));
        }
        if verification.allowed_domain.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "verification.allowed_domain must not be empty".to_string(),
            ));
        }
        if self.fallback.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "fallback.cleanup_interval_secs must be at least 1".to_string(),
            ));
        }
        for (name, policy) in &self.rate_limit.policies {
            if policy.max_requests == 0 || policy.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.policies.{} needs a positive max_requests and window_secs",
                    name
                )));
            }
        }
        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.fallback.cleanup_interval_secs)
    }
}
