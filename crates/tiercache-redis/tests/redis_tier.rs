//! Integration tests for the Redis tier.
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::time::Duration;

use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache_core::{KeyCodec, RemoteTier, Tier2Policy};
use tiercache_redis::{RedisConfig, RedisTier, create_redis_tier};
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_tier() -> RedisTier {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 5,
        timeout_ms: 5000,
    };
    create_redis_tier(&config).expect("create redis tier")
}

#[tokio::test]
async fn test_redis_tier_ping() {
    let tier = redis_tier().await;
    assert!(tier.ping().await.is_ok());
}

#[tokio::test]
async fn test_redis_tier_set_get_remove() {
    let tier = redis_tier().await;
    let key = KeyCodec::new("it").encode("set_get_remove").unwrap();

    tier.set(
        &key,
        b"payload",
        &Tier2Policy::absolute(Duration::from_secs(60)),
    )
    .await
    .unwrap();

    assert_eq!(tier.get(&key).await.unwrap(), Some(b"payload".to_vec()));

    tier.remove(&key).await.unwrap();
    assert_eq!(tier.get(&key).await.unwrap(), None);

    // Removing a missing key is not an error
    tier.remove(&key).await.unwrap();
}

#[tokio::test]
async fn test_redis_tier_overwrite() {
    let tier = redis_tier().await;
    let key = KeyCodec::new("it").encode("overwrite").unwrap();
    let policy = Tier2Policy::absolute(Duration::from_secs(60));

    tier.set(&key, b"first", &policy).await.unwrap();
    tier.set(&key, b"second", &policy).await.unwrap();

    assert_eq!(tier.get(&key).await.unwrap(), Some(b"second".to_vec()));
}

#[tokio::test]
async fn test_redis_tier_absolute_expiration() {
    let tier = redis_tier().await;
    let key = KeyCodec::new("it").encode("absolute").unwrap();

    tier.set(
        &key,
        b"short-lived",
        &Tier2Policy::absolute(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    assert!(tier.get(&key).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(tier.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_redis_tier_sliding_expiration_refreshes_on_read() {
    let tier = redis_tier().await;
    let key = KeyCodec::new("it").encode("sliding").unwrap();

    tier.set(
        &key,
        b"kept-alive",
        &Tier2Policy::sliding(Duration::from_millis(600)),
    )
    .await
    .unwrap();

    // Each read lands inside the idle window and pushes the expiry forward.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(tier.get(&key).await.unwrap().is_some());
    }

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(tier.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_redis_reports_connection_error() {
    let config = RedisConfig {
        enabled: true,
        url: "redis://nonexistent:9999".to_string(),
        pool_size: 2,
        timeout_ms: 500,
    };

    // Pool creation is lazy, the failure shows up on first use
    let tier = create_redis_tier(&config).expect("pool is created lazily");
    let key = KeyCodec::default().encode("k").unwrap();

    assert!(tier.ping().await.is_err());
    assert!(tier.get(&key).await.is_err());
}
