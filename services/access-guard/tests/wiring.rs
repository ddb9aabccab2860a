use std::sync::Arc;
use std::time::Duration;

use access_guard::{AccessGuard, GuardStores, VerificationEntry};
use async_trait::async_trait;
use guard_common::{Clock, ManualClock};
use guard_config::GuardConfig;
use guard_errors::AppResult;
use guard_ports::{EmailSender, KvStore, SurveyWorkflow};

struct NullMailer;

#[async_trait]
impl EmailSender for NullMailer {
    async fn send_text_email(&self, _to: &str, _subject: &str, _body: &str) -> AppResult<()> {
        Ok(())
    }
}

struct AcceptAll;

#[async_trait]
impl SurveyWorkflow for AcceptAll {
    async fn forward(&self, _payload: &serde_json::Value) -> AppResult<()> {
        Ok(())
    }
}

fn shipped_config() -> GuardConfig {
    GuardConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config")).unwrap()
}

#[test]
fn shipped_config_matches_documented_policies() {
    let config = shipped_config();

    assert_eq!(config.verification.code_length, 6);
    assert_eq!(config.verification.ttl_secs, 300);
    assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
    for (name, max) in [("code", 5), ("verify", 10), ("submit", 3), ("questions", 10), ("default", 20)] {
        let policy = &config.rate_limit.policies[name];
        assert_eq!(policy.max_requests, max, "policy {name}");
        assert_eq!(policy.window_secs, 60);
    }
}

#[tokio::test]
async fn local_only_guard_persists_codes_to_the_fallback_file() {
    let mut config = shipped_config();
    config.telemetry.log_level = "debug".to_string();
    guard_telemetry::init_from(&config.telemetry);
    let metrics = guard_telemetry::init_metrics().unwrap();

    let dir = std::env::temp_dir().join(format!("guard-wiring-{}", uuid::Uuid::new_v4()));
    config.redis = None;
    config.fallback.verification_file = dir.join("verification-codes.json");

    let clock = Arc::new(ManualClock::starting_now());
    let stores = GuardStores::connect(&config, clock.clone()).await;
    assert!(!stores.verification.has_primary());

    let guard = AccessGuard::new(stores, &config, clock.clone(), Arc::new(NullMailer), Arc::new(AcceptAll));
    guard.request_code("Student@example.edu").await.unwrap();

    let raw = std::fs::read_to_string(&config.fallback.verification_file).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let stored = &document["student@example.edu"];
    assert_eq!(stored["codeHash"].as_str().unwrap().len(), 64);
    assert!(stored[guard_adapter_local::STORE_EXPIRY_FIELD].is_string());
    let entry: VerificationEntry = serde_json::from_value(stored.clone()).unwrap();
    assert_eq!(entry.attempts, 0);
    assert!(entry.expires_at > clock.now());
    assert!(metrics.render().contains("guard_codes_issued_total"));

    // 过期条目在下一次写入时从文件中清除
    clock.advance(chrono::Duration::minutes(10));
    guard.request_code("other@example.edu").await.unwrap();
    let raw = std::fs::read_to_string(&config.fallback.verification_file).unwrap();
    assert!(!raw.contains("student@example.edu"));
    assert!(raw.contains("other@example.edu"));

    // 重新打开后验证码仍可读
    let reopened = GuardStores::connect(&config, clock.clone()).await;
    assert!(reopened.verification.get("other@example.edu").await.unwrap().is_some());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn connect_with_system_clock_runs_local_only() {
    let dir = std::env::temp_dir().join(format!("guard-connect-{}", uuid::Uuid::new_v4()));
    let mut config = shipped_config();
    config.redis = None;
    config.fallback.verification_file = dir.join("verification-codes.json");

    let guard = AccessGuard::connect(&config, Arc::new(NullMailer), Arc::new(AcceptAll)).await;
    let dispatch = guard.request_code("student@example.edu").await.unwrap();
    dispatch.delivery.await.unwrap().unwrap();

    let result = guard.verify_code("student@example.edu", "000000").await.unwrap();
    assert_eq!(result.attempts_left, Some(2));

    let _ = std::fs::remove_dir_all(dir);
}
