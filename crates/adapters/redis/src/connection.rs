//! Redis 连接管理

use guard_errors::{AppError, AppResult};
use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// 创建 Redis 连接管理器，建立连接的时间不超过 `timeout`
pub async fn create_connection_manager(url: &str, timeout: Duration) -> AppResult<ConnectionManager> {
    let client = Client::open(url)
        .map_err(|e| AppError::storage(format!("Failed to create Redis client: {}", e)))?;

    tokio::time::timeout(timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| AppError::storage("Timed out connecting to Redis"))?
        .map_err(|e| {
            AppError::storage(format!("Failed to create Redis connection manager: {}", e))
        })
}

/// 检查 Redis 连接
pub async fn check_connection(conn: &mut ConnectionManager) -> AppResult<()> {
    redis::cmd("PING")
        .query_async::<String>(conn)
        .await
        .map_err(|e| AppError::storage(format!("Redis health check failed: {}", e)))?;
    Ok(())
}
