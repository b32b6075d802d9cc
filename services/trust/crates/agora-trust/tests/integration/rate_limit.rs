//! Backend selection and the shared Valkey window.
//!
//! Valkey tests run only when `AGORA_TEST_VALKEY_URL` points at a live server.

use std::time::Duration;

use agora_common::{RateLimitBackendKind, Settings};
use agora_trust::{
    MemoryRateLimiter, RateLimitRule, RateLimiter, ValkeyRateLimiter, build_rate_limiter,
    enforce_all,
};
use uuid::Uuid;

fn valkey_url() -> Option<String> {
    std::env::var("AGORA_TEST_VALKEY_URL")
        .ok()
        .filter(|u| !u.is_empty())
}

async fn valkey_limiter(url: &str, prefix: &str) -> ValkeyRateLimiter {
    ValkeyRateLimiter::connect(url, prefix, Duration::from_millis(500))
        .await
        .unwrap()
}

#[tokio::test]
async fn memory_backend_without_valkey_url() {
    let settings = Settings {
        rate_limit_backend: RateLimitBackendKind::Auto,
        valkey_url: None,
        ..Settings::default()
    };
    let limiter = build_rate_limiter(&settings).await.unwrap();
    assert_eq!(limiter.backend_name(), "memory");
}

#[tokio::test]
async fn explicit_valkey_without_url_is_a_startup_error() {
    let settings = Settings {
        rate_limit_backend: RateLimitBackendKind::Valkey,
        valkey_url: None,
        ..Settings::default()
    };
    assert!(build_rate_limiter(&settings).await.is_err());
}

const FORWARDED_KEY: &str = "register:ip:198.51.100.1, 203.0.113.9";

async fn admits_then_limits(limiter: &dyn RateLimiter, key: &str) {
    assert!(limiter.check(key, 1, 60).await.unwrap().allowed);
    assert!(!limiter.check(key, 1, 60).await.unwrap().allowed);
}

#[tokio::test]
async fn memory_backend_accepts_any_bucket_id() {
    let limiter = MemoryRateLimiter::new();
    admits_then_limits(&limiter, FORWARDED_KEY).await;
    admits_then_limits(&limiter, &"k".repeat(300)).await;
}

#[tokio::test]
async fn valkey_backend_accepts_the_same_bucket_ids() {
    let Some(url) = valkey_url() else {
        return;
    };
    let prefix = format!("agora:test:{}", Uuid::new_v4());
    let limiter = valkey_limiter(&url, &prefix).await;
    admits_then_limits(&limiter, FORWARDED_KEY).await;
    admits_then_limits(&limiter, &"k".repeat(300)).await;
}

#[tokio::test]
async fn valkey_window_is_shared_between_instances() {
    let Some(url) = valkey_url() else {
        return;
    };
    let prefix = format!("agora:test:{}", Uuid::new_v4());
    let a = valkey_limiter(&url, &prefix).await;
    let b = valkey_limiter(&url, &prefix).await;

    for limiter in [&a, &b, &a] {
        assert!(limiter.check("register:ip:1.2.3.4", 3, 60).await.unwrap().allowed);
    }
    let denied = b.check("register:ip:1.2.3.4", 3, 60).await.unwrap();
    assert!(!denied.allowed);
    assert!((1..=60).contains(&denied.retry_after_seconds));

    // Other buckets are independent.
    assert!(a.check("register:ip:5.6.7.8", 3, 60).await.unwrap().allowed);
}

#[tokio::test]
async fn valkey_concurrent_checks_never_overshoot() {
    let Some(url) = valkey_url() else {
        return;
    };
    let prefix = format!("agora:test:{}", Uuid::new_v4());
    let limiter = std::sync::Arc::new(valkey_limiter(&url, &prefix).await);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.check("burst", 5, 60).await.unwrap().allowed
        }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn valkey_backs_enforce_all() {
    let Some(url) = valkey_url() else {
        return;
    };
    let prefix = format!("agora:test:{}", Uuid::new_v4());
    let limiter = valkey_limiter(&url, &prefix).await;
    let rules = [
        RateLimitRule::new("admin:ip", "203.0.113.1", 1, 60),
        RateLimitRule::new("admin:global", "all", 10, 60),
    ];
    enforce_all(&limiter, &rules).await.unwrap();
    assert!(enforce_all(&limiter, &rules).await.is_err());
}
