//! 带降级的存储
//!
//! 主存储（Redis）每次调用都有超时，失败或超时后同一操作转到本地存储执行。
//! 调用方看不到存储故障：读失败表现为"不存在"，写失败表现为"未生效"。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guard_adapter_local::LocalKvStore;
use guard_adapter_redis::{RedisKvStore, check_connection, create_connection_manager};
use guard_common::SharedClock;
use guard_config::GuardConfig;
use guard_errors::{AppError, AppResult};
use guard_ports::{KvStore, WindowHit};
use metrics::counter;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

/// 主存储默认超时
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(1500);

/// 主存储 + 本地降级存储
pub struct FailoverStore {
    primary: Option<Arc<dyn KvStore>>,
    fallback: Arc<LocalKvStore>,
    timeout: Duration,
    verbose_errors: bool,
}

impl FailoverStore {
    pub fn new(primary: Option<Arc<dyn KvStore>>, fallback: Arc<LocalKvStore>) -> Self {
        Self {
            primary,
            fallback,
            timeout: DEFAULT_STORE_TIMEOUT,
            verbose_errors: true,
        }
    }

    /// 仅使用本地存储
    pub fn local_only(fallback: Arc<LocalKvStore>) -> Self {
        Self::new(None, fallback)
    }

    /// 设置主存储调用超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 是否在日志中输出主存储错误详情（生产环境关闭）
    pub fn with_verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn fallback(&self) -> &Arc<LocalKvStore> {
        &self.fallback
    }

    /// 在主存储上执行操作，失败或超时返回 None
    async fn on_primary<T, F, Fut>(&self, op: &'static str, call: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn KvStore>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let primary = self.primary.as_ref()?;

        match tokio::time::timeout(self.timeout, call(Arc::clone(primary))).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.report_primary_failure(op, &e.to_string());
                None
            }
            Err(_) => {
                self.report_primary_failure(op, "timed out");
                None
            }
        }
    }

    fn report_primary_failure(&self, op: &'static str, detail: &str) {
        counter!("guard_store_fallbacks_total", "op" => op).increment(1);

        if self.verbose_errors {
            warn!(op, error = %detail, "Primary store failed, using fallback");
        } else {
            warn!(op, "Primary store unavailable, using fallback");
        }
    }

    /// 本地存储出错时记录日志并返回默认值
    fn absorb<T>(&self, op: &'static str, result: AppResult<T>, default: T) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                if self.verbose_errors {
                    warn!(op, error = %e, "Fallback store failed");
                } else {
                    warn!(op, "Fallback store failed");
                }
                default
            }
        }
    }
}

#[async_trait]
impl KvStore for FailoverStore {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        if let Some(value) = self.on_primary("get", |s| async move { s.get(key).await }).await {
            return Ok(value);
        }
        Ok(self.absorb("get", self.fallback.get(key).await, None))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        if let Some(()) = self
            .on_primary("set", |s| async move { s.set(key, value, ttl).await })
            .await
        {
            return Ok(());
        }
        self.absorb("set", self.fallback.set(key, value, ttl).await, ());
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        if let Some(()) = self
            .on_primary("delete", |s| async move { s.delete(key).await })
            .await
        {
            return Ok(());
        }
        self.absorb("delete", self.fallback.delete(key).await, ());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        if let Some(created) = self
            .on_primary("set_nx", |s| async move { s.set_nx(key, value, ttl).await })
            .await
        {
            return Ok(created);
        }
        Ok(self.absorb("set_nx", self.fallback.set_nx(key, value, ttl).await, false))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        if let Some(swapped) = self
            .on_primary("compare_and_set", |s| async move {
                s.compare_and_set(key, expected, value, ttl).await
            })
            .await
        {
            return Ok(swapped);
        }
        let result = self.fallback.compare_and_set(key, expected, value, ttl).await;
        Ok(self.absorb("compare_and_set", result, false))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        if let Some(deleted) = self
            .on_primary("delete_if_equals", |s| async move {
                s.delete_if_equals(key, expected).await
            })
            .await
        {
            return Ok(deleted);
        }
        let result = self.fallback.delete_if_equals(key, expected).await;
        Ok(self.absorb("delete_if_equals", result, false))
    }

    /// 本地存储也失败时返回错误，由限流器决定放行策略
    async fn hit_window(&self, key: &str, limit: u64, window: Duration) -> AppResult<WindowHit> {
        if let Some(hit) = self
            .on_primary("hit_window", |s| async move { s.hit_window(key, limit, window).await })
            .await
        {
            return Ok(hit);
        }
        self.fallback.hit_window(key, limit, window).await
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        self.fallback.purge_expired().await
    }
}

/// 三个组件各自的存储
///
/// 共享一个 Redis 连接（按命名空间区分键），本地降级存储各自独立
pub struct GuardStores {
    pub verification: Arc<FailoverStore>,
    pub rate_limit: Arc<FailoverStore>,
    pub submission: Arc<FailoverStore>,
}

impl GuardStores {
    /// 按配置建立存储，Redis 未配置或连接失败时只使用本地存储
    pub async fn connect(config: &GuardConfig, clock: SharedClock) -> Self {
        let verbose = !config.is_production();

        let (conn, prefix, timeout) = match &config.redis {
            Some(redis) => {
                let connected = async {
                    let mut conn =
                        create_connection_manager(redis.url.expose_secret(), redis.timeout()).await?;
                    check_connection(&mut conn).await?;
                    Ok::<_, AppError>(conn)
                };

                match connected.await {
                    Ok(conn) => {
                        info!(key_prefix = %redis.key_prefix, "Connected to primary store");
                        (Some(conn), redis.key_prefix.clone(), redis.timeout())
                    }
                    Err(e) => {
                        if verbose {
                            warn!(error = %e, "Primary store unreachable, using local fallback only");
                        } else {
                            warn!("Primary store unreachable, using local fallback only");
                        }
                        (None, redis.key_prefix.clone(), redis.timeout())
                    }
                }
            }
            None => {
                info!("Primary store not configured, using local fallback only");
                (None, String::new(), DEFAULT_STORE_TIMEOUT)
            }
        };

        let primary = |namespace: &str| -> Option<Arc<dyn KvStore>> {
            conn.clone().map(|conn| {
                Arc::new(
                    RedisKvStore::new(conn).with_key_prefix(format!("{}:{}", prefix, namespace)),
                ) as Arc<dyn KvStore>
            })
        };

        let verification_fallback = Arc::new(
            LocalKvStore::open(config.fallback.verification_file.clone(), clock.clone()).await,
        );
        let rate_limit_fallback = Arc::new(LocalKvStore::in_memory(clock.clone()));
        let submission_fallback = Arc::new(match &config.fallback.submission_file {
            Some(path) => LocalKvStore::open(path.clone(), clock.clone()).await,
            None => LocalKvStore::in_memory(clock.clone()),
        });

        let build = |namespace: &str, fallback: Arc<LocalKvStore>| {
            Arc::new(
                FailoverStore::new(primary(namespace), fallback)
                    .with_timeout(timeout)
                    .with_verbose_errors(verbose),
            )
        };

        debug!("Guard stores initialised");

        Self {
            verification: build("otp", verification_fallback),
            rate_limit: build("ratelimit", rate_limit_fallback),
            submission: build("submission", submission_fallback),
        }
    }

    /// 纯内存存储（测试和单机开发用）
    pub fn in_memory(clock: SharedClock) -> Self {
        let local = || {
            Arc::new(FailoverStore::local_only(Arc::new(LocalKvStore::in_memory(
                clock.clone(),
            ))))
        };

        Self {
            verification: local(),
            rate_limit: local(),
            submission: local(),
        }
    }

    /// 所有本地降级存储
    pub fn fallbacks(&self) -> Vec<Arc<LocalKvStore>> {
        vec![
            Arc::clone(self.verification.fallback()),
            Arc::clone(self.rate_limit.fallback()),
            Arc::clone(self.submission.fallback()),
        ]
    }
}
