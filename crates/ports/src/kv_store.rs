//! 键值存储 trait 定义

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guard_errors::AppResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 一次窗口计数的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowHit {
    /// 是否允许
    pub allowed: bool,
    /// 当前窗口剩余配额
    pub remaining: u64,
    /// 窗口重置时间
    pub reset_at: DateTime<Utc>,
}

/// 带 TTL 的键值存储
///
/// 每个方法对单个 key 必须是原子的
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 存储名称（诊断用）
    fn name(&self) -> &'static str;

    /// 获取值
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// 设置值并指定 TTL（覆盖已有值）
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// 删除
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// 仅当 key 不存在时设置，返回是否设置成功
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// 仅当当前值等于 `expected` 时替换，返回是否替换成功
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool>;

    /// 仅当当前值等于 `expected` 时删除，返回是否删除成功
    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// 在 `window` 内对 key 计数一次，超过 `limit` 时拒绝且不计数
    async fn hit_window(&self, key: &str, limit: u64, window: Duration) -> AppResult<WindowHit>;

    /// 清理已过期条目，返回清理数量
    ///
    /// 原生支持过期的存储无需实现
    async fn purge_expired(&self) -> AppResult<usize> {
        Ok(0)
    }
}
