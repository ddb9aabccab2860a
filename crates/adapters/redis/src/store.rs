//! Redis 键值存储实现
//!
//! 过期由 Redis 原生处理，读改写操作通过 Lua 脚本保证单 key 原子性

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use guard_errors::{AppError, AppResult};
use guard_ports::{KvStore, WindowHit};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::debug;

/// Lua 脚本：值相等时替换并设置 TTL
///
/// - KEYS[1]: 键
/// - ARGV[1]: 期望的旧值
/// - ARGV[2]: 新值
/// - ARGV[3]: TTL（毫秒）
pub(crate) static COMPARE_AND_SET_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
";

/// Lua 脚本：值相等时删除
pub(crate) static DELETE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Lua 脚本：滑动窗口计数
///
/// - KEYS[1]: 键
/// - ARGV[1]: 最大请求数
/// - ARGV[2]: 窗口大小（毫秒）
/// - ARGV[3]: 当前时间（毫秒）
/// - ARGV[4]: 本次请求的唯一成员
///
/// 返回 {allowed, remaining, reset_after_ms}
pub(crate) static SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

-- 移除窗口外的请求
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)

local current = redis.call('ZCARD', key)
local allowed = current < limit

if allowed then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window_ms)
    current = current + 1
end

local remaining = limit - current
if remaining < 0 then
    remaining = 0
end

-- 最早的请求离开窗口的时间
local reset_after = window_ms
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest >= 2 then
    reset_after = tonumber(oldest[2]) + window_ms - now
    if reset_after < 0 then
        reset_after = 0
    end
end

return {allowed and 1 or 0, remaining, reset_after}
";

/// Redis 键值存储
pub struct RedisKvStore {
    conn: ConnectionManager,
    key_prefix: String,
    compare_and_set: Script,
    delete_if_equals: Script,
    sliding_window: Script,
}

impl RedisKvStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: "guard".to_string(),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
            delete_if_equals: Script::new(DELETE_IF_EQUALS_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    /// 设置键前缀
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

/// Redis 的 PX 参数必须为正数
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisKvStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.key(key))
            .await
            .map_err(|e| AppError::storage(format!("Redis get failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| AppError::storage(format!("Redis set failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.del(self.key(key))
            .await
            .map_err(|e| AppError::storage(format!("Redis delete failed: {}", e)))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();

        let result: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::storage(format!("Redis set_nx failed: {}", e)))?;

        Ok(result.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let mut conn = self.conn.clone();

        let swapped: i64 = self
            .compare_and_set
            .key(self.key(key))
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::storage(format!("Redis compare_and_set failed: {}", e)))?;

        Ok(swapped == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();

        let deleted: i64 = self
            .delete_if_equals
            .key(self.key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::storage(format!("Redis delete_if_equals failed: {}", e)))?;

        Ok(deleted > 0)
    }

    async fn hit_window(&self, key: &str, limit: u64, window: Duration) -> AppResult<WindowHit> {
        let mut conn = self.conn.clone();
        let now = Utc::now();

        let result: Vec<i64> = self
            .sliding_window
            .key(self.key(key))
            .arg(limit)
            .arg(ttl_millis(window))
            .arg(now.timestamp_millis())
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::storage(format!("Rate limit check failed: {}", e)))?;

        if result.len() != 3 {
            return Err(AppError::storage(format!(
                "Unexpected sliding window result length: {}",
                result.len()
            )));
        }

        let hit = WindowHit {
            allowed: result[0] == 1,
            remaining: result[1].max(0) as u64,
            reset_at: now + ChronoDuration::milliseconds(result[2].max(0)),
        };

        debug!(
            key = %key,
            allowed = hit.allowed,
            remaining = hit.remaining,
            "Sliding window rate limit check"
        );

        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_connection_manager;

    #[test]
    fn test_sliding_window_script_validity() {
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZCARD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZADD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
    }

    #[test]
    fn test_compare_scripts_check_current_value() {
        assert!(COMPARE_AND_SET_SCRIPT.contains("redis.call('GET', KEYS[1]) == ARGV[1]"));
        assert!(COMPARE_AND_SET_SCRIPT.contains("'PX'"));
        assert!(DELETE_IF_EQUALS_SCRIPT.contains("redis.call('DEL', KEYS[1])"));
    }

    #[test]
    fn test_ttl_millis_is_positive() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    async fn connect() -> RedisKvStore {
        let conn = create_connection_manager("redis://127.0.0.1:6379", Duration::from_secs(2))
            .await
            .unwrap();
        RedisKvStore::new(conn).with_key_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 实例
    async fn test_compare_and_set_roundtrip() {
        let store = connect().await;
        let ttl = Duration::from_secs(30);

        store.set("entry", "v1", ttl).await.unwrap();
        assert!(!store.compare_and_set("entry", "stale", "v2", ttl).await.unwrap());
        assert!(store.compare_and_set("entry", "v1", "v2", ttl).await.unwrap());
        assert_eq!(store.get("entry").await.unwrap().as_deref(), Some("v2"));

        assert!(!store.delete_if_equals("entry", "v1").await.unwrap());
        assert!(store.delete_if_equals("entry", "v2").await.unwrap());
        assert!(store.get("entry").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 实例
    async fn test_set_nx_only_once() {
        let store = connect().await;
        let ttl = Duration::from_secs(30);

        assert!(store.set_nx("claim", "a", ttl).await.unwrap());
        assert!(!store.set_nx("claim", "b", ttl).await.unwrap());
        store.delete("claim").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 实例
    async fn test_sliding_window_rate_limiter() {
        let store = connect().await;
        let window = Duration::from_secs(60);

        for expected_remaining in (0..5).rev() {
            let hit = store.hit_window("ip:1", 5, window).await.unwrap();
            assert!(hit.allowed);
            assert_eq!(hit.remaining, expected_remaining);
        }

        // 第 6 次请求应该被限流
        let hit = store.hit_window("ip:1", 5, window).await.unwrap();
        assert!(!hit.allowed);
        assert_eq!(hit.remaining, 0);

        store.delete("ip:1").await.unwrap();
    }
}
