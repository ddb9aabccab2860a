//! 本地键值存储实现

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use guard_common::SharedClock;
use guard_errors::{AppError, AppResult};
use guard_ports::{KvStore, WindowHit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 文件中存储层过期时间的字段名
pub const STORE_EXPIRY_FIELD: &str = "storeExpiresAt";

/// 值不是 JSON 对象时在文件中的字段名
pub const RAW_VALUE_FIELD: &str = "rawValue";

/// 本地条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl LocalEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 文件表示：JSON 对象值直接展开并附上过期时间，其余值放进 `rawValue`
    fn to_document(&self) -> AppResult<Value> {
        let mut object = match serde_json::from_str::<Value>(&self.value) {
            Ok(Value::Object(map))
                if !map.contains_key(STORE_EXPIRY_FIELD) && !map.contains_key(RAW_VALUE_FIELD) =>
            {
                map
            }
            _ => Map::from_iter([(RAW_VALUE_FIELD.to_string(), Value::String(self.value.clone()))]),
        };
        object.insert(STORE_EXPIRY_FIELD.to_string(), serde_json::to_value(self.expires_at)?);
        Ok(Value::Object(object))
    }

    fn from_document(document: Value) -> Option<Self> {
        let Value::Object(mut object) = document else {
            return None;
        };
        let expires_at = serde_json::from_value(object.remove(STORE_EXPIRY_FIELD)?).ok()?;

        let value = match object.remove(RAW_VALUE_FIELD) {
            Some(Value::String(raw)) if object.is_empty() => raw,
            Some(other) => {
                object.insert(RAW_VALUE_FIELD.to_string(), other);
                serde_json::to_string(&object).ok()?
            }
            None => serde_json::to_string(&object).ok()?,
        };

        Some(Self { value, expires_at })
    }
}

/// 窗口计数记录
#[derive(Debug, Serialize, Deserialize)]
struct WindowRecord {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// 本地键值存储
///
/// 所有操作在同一把锁内完成读改写，配置了文件时每次变更都整体重写文件
pub struct LocalKvStore {
    entries: Mutex<HashMap<String, LocalEntry>>,
    file: Option<PathBuf>,
    clock: SharedClock,
}

impl LocalKvStore {
    /// 纯内存存储
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            file: None,
            clock,
        }
    }

    /// 文件持久化存储，启动时加载已有文档并丢弃过期条目
    pub async fn open(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let path = path.into();
        let now = clock.now();

        let entries = match load_document(&path).await {
            Ok(document) => document
                .into_iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable fallback store file");
                HashMap::new()
            }
        };

        debug!(path = %path.display(), entries = entries.len(), "Fallback store loaded");

        Self {
            entries: Mutex::new(entries),
            file: Some(path),
            clock,
        }
    }

    /// 持久化文件路径
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// 未过期条目数量
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        self.clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// 获取未过期的值
    fn live<'a>(
        entries: &'a HashMap<String, LocalEntry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a LocalEntry> {
        entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    /// 清理过期条目后整体写回文件，必须在持有锁时调用
    async fn persist(&self, entries: &mut HashMap<String, LocalEntry>) {
        let now = self.clock.now();
        entries.retain(|_, entry| !entry.is_expired(now));

        let Some(path) = &self.file else {
            return;
        };

        if let Err(e) = write_document(path, entries).await {
            warn!(path = %path.display(), error = %e, "Failed to persist fallback store");
        }
    }
}

async fn load_document(path: &Path) -> AppResult<HashMap<String, LocalEntry>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(AppError::storage(format!("Failed to read fallback file: {}", e))),
    };

    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let document: BTreeMap<String, Value> = serde_json::from_str(&raw)
        .map_err(|e| AppError::storage(format!("Corrupt fallback file: {}", e)))?;

    Ok(document
        .into_iter()
        .filter_map(|(key, value)| match LocalEntry::from_document(value) {
            Some(entry) => Some((key, entry)),
            None => {
                warn!(key = %key, "Skipping malformed fallback entry");
                None
            }
        })
        .collect())
}

/// 先写临时文件再 rename，读者不会看到写了一半的文档
async fn write_document(path: &Path, entries: &HashMap<String, LocalEntry>) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::storage(format!("Failed to create fallback dir: {}", e)))?;
    }

    let document = entries
        .iter()
        .map(|(key, entry)| Ok((key, entry.to_document()?)))
        .collect::<AppResult<BTreeMap<_, _>>>()?;
    let json = serde_json::to_vec_pretty(&document)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| AppError::storage(format!("Failed to write fallback file: {}", e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AppError::storage(format!("Failed to replace fallback file: {}", e)))?;

    Ok(())
}

#[async_trait]
impl KvStore for LocalKvStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }

        // 过期条目惰性移除，下一次写入时再落盘
        entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;

        entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        self.persist(&mut entries).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut entries = self.entries.lock().await;

        if entries.remove(key).is_some() {
            self.persist(&mut entries).await;
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;

        if Self::live(&entries, key, now).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        self.persist(&mut entries).await;
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;

        match Self::live(&entries, key, now) {
            Some(entry) if entry.value == expected => {}
            _ => return Ok(false),
        }

        entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        self.persist(&mut entries).await;
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match Self::live(&entries, key, now) {
            Some(entry) if entry.value == expected => {}
            _ => return Ok(false),
        }

        entries.remove(key);
        self.persist(&mut entries).await;
        Ok(true)
    }

    async fn hit_window(&self, key: &str, limit: u64, window: Duration) -> AppResult<WindowHit> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let current = Self::live(&entries, key, now)
            .and_then(|entry| serde_json::from_str::<WindowRecord>(&entry.value).ok())
            .filter(|record| now < record.reset_at);

        let (record, hit) = match current {
            // 窗口内已达上限：拒绝，不计数，重置时间不变
            Some(record) if record.count >= limit => {
                let hit = WindowHit {
                    allowed: false,
                    remaining: 0,
                    reset_at: record.reset_at,
                };
                return Ok(hit);
            }
            Some(record) => {
                let count = record.count + 1;
                let hit = WindowHit {
                    allowed: true,
                    remaining: limit.saturating_sub(count),
                    reset_at: record.reset_at,
                };
                (
                    WindowRecord {
                        count,
                        reset_at: record.reset_at,
                    },
                    hit,
                )
            }
            None => {
                let reset_at = self.expiry(window);
                let hit = WindowHit {
                    allowed: limit > 0,
                    remaining: limit.saturating_sub(1),
                    reset_at,
                };
                if limit == 0 {
                    return Ok(hit);
                }
                (WindowRecord { count: 1, reset_at }, hit)
            }
        };

        entries.insert(
            key.to_string(),
            LocalEntry {
                value: serde_json::to_string(&record)?,
                expires_at: record.reset_at,
            },
        );
        self.persist(&mut entries).await;

        Ok(hit)
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();

        if purged > 0 {
            self.persist(&mut entries).await;
            debug!(purged, "Purged expired fallback entries");
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_common::ManualClock;
    use std::sync::Arc;

    fn store() -> (LocalKvStore, ManualClock) {
        let clock = ManualClock::starting_now();
        (LocalKvStore::in_memory(Arc::new(clock.clone())), clock)
    }

    fn temp_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("guard-local-{}", uuid::Uuid::new_v4()))
            .join("store.json")
    }

    #[tokio::test]
    async fn test_entries_expire_at_ttl() {
        let (store, clock) = store();

        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        clock.advance(ChronoDuration::seconds(9));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(ChronoDuration::seconds(1));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_current_value() {
        let (store, _clock) = store();
        let ttl = Duration::from_secs(60);

        store.set("k", "v1", ttl).await.unwrap();
        assert!(!store.compare_and_set("k", "v0", "v2", ttl).await.unwrap());
        assert!(store.compare_and_set("k", "v1", "v2", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(!store.compare_and_set("missing", "v1", "v2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let (store, _clock) = store();

        store.set("k", "v1", Duration::from_secs(60)).await.unwrap();
        assert!(!store.delete_if_equals("k", "other").await.unwrap());
        assert!(store.delete_if_equals("k", "v1").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_nx_respects_expiry() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(5);

        assert!(store.set_nx("claim", "a", ttl).await.unwrap());
        assert!(!store.set_nx("claim", "b", ttl).await.unwrap());

        clock.advance(ChronoDuration::seconds(5));
        assert!(store.set_nx("claim", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_counter() {
        let (store, clock) = store();
        let window = Duration::from_secs(60);

        let first = store.hit_window("ip", 2, window).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = store.hit_window("ip", 2, window).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.reset_at, first.reset_at);

        let third = store.hit_window("ip", 2, window).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.reset_at, first.reset_at);

        clock.advance(ChronoDuration::seconds(60));
        let fresh = store.hit_window("ip", 2, window).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
        assert!(fresh.reset_at > first.reset_at);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();

        store.set("short", "1", Duration::from_secs(1)).await.unwrap();
        store.set("long", "2", Duration::from_secs(100)).await.unwrap();
        clock.advance(ChronoDuration::seconds(2));

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_persistence_survives_reopen() {
        let path = temp_file();
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());

        let store = LocalKvStore::open(&path, shared.clone()).await;
        store.set("alice@example.edu", "{}", Duration::from_secs(300)).await.unwrap();
        store.set("bob@example.edu", "{}", Duration::from_secs(1)).await.unwrap();
        drop(store);

        clock.advance(ChronoDuration::seconds(2));
        let reopened = LocalKvStore::open(&path, shared).await;

        assert_eq!(reopened.len().await, 1);
        assert!(reopened.get("alice@example.edu").await.unwrap().is_some());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_writes_drop_expired_entries_from_file() {
        let path = temp_file();
        let clock = ManualClock::starting_now();
        let store = LocalKvStore::open(&path, Arc::new(clock.clone())).await;

        store.set("old", "1", Duration::from_secs(1)).await.unwrap();
        clock.advance(ChronoDuration::seconds(5));
        store.set("new", "2", Duration::from_secs(60)).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let document: BTreeMap<String, Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(document.len(), 1);
        assert!(document.contains_key("new"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_object_values_are_stored_inline() {
        let path = temp_file();
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let store = LocalKvStore::open(&path, shared.clone()).await;

        let entry = r#"{"codeHash":"abc","attempts":1}"#;
        store.set("alice@example.edu", entry, Duration::from_secs(60)).await.unwrap();
        store.set("claim:10.0.0.1", "token-1", Duration::from_secs(60)).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["alice@example.edu"]["codeHash"], "abc");
        assert_eq!(document["alice@example.edu"]["attempts"], 1);
        assert!(document["alice@example.edu"][STORE_EXPIRY_FIELD].is_string());
        assert_eq!(document["claim:10.0.0.1"][RAW_VALUE_FIELD], "token-1");

        let reopened = LocalKvStore::open(&path, shared).await;
        let value = reopened.get("alice@example.edu").await.unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed, serde_json::json!({"codeHash": "abc", "attempts": 1}));
        assert_eq!(reopened.get("claim:10.0.0.1").await.unwrap().as_deref(), Some("token-1"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_treated_as_empty() {
        let path = temp_file();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let store = LocalKvStore::open(&path, Arc::new(ManualClock::starting_now())).await;
        assert!(store.is_empty().await);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
