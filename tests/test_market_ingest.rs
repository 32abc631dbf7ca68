mod common;

use std::time::Duration;

use common::{definition, eventually, test_settings, Harness, BROKER, SYMBOL};
use strategy_runtime::trading::model::{EventType, RuntimeEvent};
use strategy_runtime::trading::services::EventSubscription;

async fn next_of_type(events: &mut EventSubscription, event_type: EventType) -> RuntimeEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.next().await {
                Some(event) if event.event_type == event_type => return event,
                Some(_) => continue,
                None => panic!("事件流已关闭"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("等待 {} 超时", event_type.as_str()))
}

/// 同一 symbol 两个策略共享订阅，最后一个离开时才退订
#[tokio::test]
async fn test_symbol_subscription_is_ref_counted() {
    let harness = Harness::new();
    harness.start(definition("s1", "u1", 2500.0)).await;
    harness.start(definition("s2", "u1", 2400.0)).await;

    let ingest = harness.services.ingest.clone();
    assert_eq!(
        ingest.subscribed_symbols("u1", BROKER).await,
        vec![SYMBOL.to_string()]
    );
    assert_eq!(harness.paper.stream_attempts(), 1);

    harness
        .services
        .manager
        .stop_strategy("s1", false)
        .await
        .unwrap();
    assert_eq!(
        ingest.subscribed_symbols("u1", BROKER).await,
        vec![SYMBOL.to_string()]
    );
    assert!(harness.paper.subscribed_symbols().await.contains(SYMBOL));

    harness
        .services
        .manager
        .stop_strategy("s2", false)
        .await
        .unwrap();
    assert!(ingest.subscribed_symbols("u1", BROKER).await.is_empty());
    assert!(!ingest.is_connected("u1", BROKER).await);
    assert!(harness.paper.subscribed_symbols().await.is_empty());
}

/// 行情价格同时推送给事件总线
#[tokio::test]
async fn test_ticks_are_published_as_price_updates() {
    let harness = Harness::new();
    let mut events = harness.services.event_bus.subscribe("u1", None);
    harness.start(definition("s1", "u1", 2500.0)).await;

    harness
        .paper
        .push_raw(serde_json::json!({ "symbol": SYMBOL, "ltp": "2612.5" }))
        .await;
    // 未订阅的 symbol 与无法解析的行情被丢弃
    harness
        .paper
        .push_raw(serde_json::json!({ "symbol": "TCS", "ltp": 3500.0 }))
        .await;
    harness
        .paper
        .push_raw(serde_json::json!({ "symbol": SYMBOL }))
        .await;
    harness.paper.set_price(SYMBOL, 2620.0).await;

    let first = next_of_type(&mut events, EventType::PriceUpdate).await;
    assert_eq!(first.payload["symbol"], SYMBOL);
    assert_eq!(first.payload["last_traded_price"], 2612.5);
    let second = next_of_type(&mut events, EventType::PriceUpdate).await;
    assert_eq!(second.payload["last_traded_price"], 2620.0);
}

/// 重连耗尽：每个依赖策略收到 ERROR 并标注；恢复后发出 FEED_RESTORED 并清除标注
#[tokio::test]
async fn test_feed_degradation_and_recovery() {
    let mut settings = test_settings();
    settings.feed.slow_retry = Duration::from_millis(200);
    let harness = Harness::with_settings(settings);
    let mut events = harness.services.event_bus.subscribe("u1", None);
    let key = harness.start(definition("s1", "u1", 2500.0)).await;

    harness.paper.set_feed_available(false);
    harness.paper.drop_feed("socket reset").await;

    let error = next_of_type(&mut events, EventType::StrategyError).await;
    assert_eq!(error.strategy_id.as_deref(), Some("s1"));
    assert_eq!(error.payload["kind"], "FeedDisconnected");

    let state = harness.state(&key).await.unwrap();
    assert!(state
        .last_error
        .as_deref()
        .unwrap_or_default()
        .starts_with("FeedDisconnected"));
    // 行情降级不改变策略状态
    assert!(state.is_running());
    assert!(harness.services.manager.is_running("s1"));

    harness.paper.set_feed_available(true);
    let restored = next_of_type(&mut events, EventType::FeedRestored).await;
    assert_eq!(restored.strategy_id.as_deref(), Some("s1"));

    let store = harness.store.clone();
    let cleared_key = key.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            let key = cleared_key.clone();
            async move {
                use strategy_runtime::trading::cache::RuntimeStateStore;
                matches!(store.get(&key).await, Ok(Some(s)) if s.last_error.is_none())
            }
        })
        .await
    );
    assert!(harness.services.ingest.is_connected("u1", BROKER).await);
}
