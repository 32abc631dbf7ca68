mod common;

use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use tracing::info;

use common::{definition, Harness, SYMBOL};
use strategy_runtime::error::{BrokerError, ErrorKind, ExecutionError};
use strategy_runtime::trading::cache::OrderLock;
use strategy_runtime::trading::model::keys::order_lock_key;
use strategy_runtime::trading::model::{
    EventType, OrderAction, PositionState, StrategyStatus,
};
use strategy_runtime::trading::services::AuditOutcome;
use strategy_runtime::trading::strategy::ExecutionOutcome;

/// 买入成交后再次买入：前置条件不满足，不会调用券商
#[tokio::test]
async fn test_buy_then_duplicate_buy_is_rejected_locally() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;

    harness.paper.set_price(SYMBOL, 2600.0).await;
    let outcome = harness
        .services
        .engine
        .execute(&key, OrderAction::Buy)
        .await
        .unwrap();
    match outcome {
        ExecutionOutcome::Executed {
            fill_price,
            position,
            attempts,
            ..
        } => {
            assert_relative_eq!(fill_price, 2600.0);
            assert_eq!(position, PositionState::Bought);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let second = harness.services.engine.execute(&key, OrderAction::Buy).await;
    assert!(matches!(second, Err(ExecutionError::Validation(_))));
    assert_eq!(harness.paper.place_order_calls(), 1);

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.status, StrategyStatus::Running);
    assert_eq!(state.position, PositionState::Bought);
    assert_eq!(state.last_action, Some(OrderAction::Buy));
    assert_relative_eq!(state.entry_price.unwrap(), 2600.0);

    let records = harness.audit.all().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, AuditOutcome::Filled);
    assert_eq!(records[1].outcome, AuditOutcome::Failed);
    assert_eq!(records[1].error_kind, Some(ErrorKind::Validation));
    assert_eq!(records[1].attempts, 0);
}

/// 20 个并发止损卖出，只有一个到达券商
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stop_loss_submits_exactly_once() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.buy_at(&key, 2600.0).await;

    harness.paper.set_price(SYMBOL, 2490.0).await;
    harness.paper.set_order_latency(Duration::from_millis(100));

    let engine = harness.services.engine.clone();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = Arc::clone(&engine);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            engine.execute(&key, OrderAction::SlSell).await
        }));
    }

    let mut executed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ExecutionOutcome::Executed { .. }) => executed += 1,
            Ok(ExecutionOutcome::NoOp { .. }) => {}
            Err(ExecutionError::DuplicateOrder { .. }) | Err(ExecutionError::Validation(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    info!("并发止损完成 executed={}", executed);

    assert_eq!(executed, 1);
    // 一次买入 + 一次止损
    assert_eq!(harness.paper.place_order_calls(), 2);

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.position, PositionState::SlHit);
    assert_eq!(state.status, StrategyStatus::Completed);
    assert!(state.sl_triggered);
    assert_relative_eq!(state.realized_pnl.unwrap(), -1100.0);
}

/// 两次瞬时失败后第三次成功
#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.paper.set_price(SYMBOL, 2600.0).await;
    harness
        .paper
        .fail_next_orders(vec![
            BrokerError::Transient("502".into()),
            BrokerError::Transient("503".into()),
        ])
        .await;

    let outcome = harness
        .services
        .engine
        .execute(&key, OrderAction::Buy)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Executed { attempts: 3, .. }));
    assert_eq!(harness.paper.place_order_calls(), 3);

    let records = harness.audit.all().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].outcome, AuditOutcome::Filled);
}

/// 持仓时重试耗尽：进入 ERROR 并标记人工介入
#[tokio::test]
async fn test_exhausted_retries_escalate_to_manual_intervention() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.buy_at(&key, 2600.0).await;

    let mut events = harness.services.event_bus.subscribe("u1", None);
    harness
        .paper
        .fail_next_orders(vec![BrokerError::Transient("504".into()); 3])
        .await;

    let result = harness.services.engine.execute(&key, OrderAction::Sell).await;
    match result {
        Err(ExecutionError::ExecutionFailure { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(harness.paper.place_order_calls(), 4);

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.status, StrategyStatus::Error);
    assert_eq!(state.position, PositionState::Bought);
    assert!(state.needs_manual_intervention);
    assert!(state.last_error.is_some());

    let error_event = loop {
        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        if event.event_type == EventType::StrategyError {
            break event;
        }
    };
    assert_eq!(error_event.payload["kind"], "ExecutionFailure");
    assert_eq!(error_event.payload["needs_manual_intervention"], true);
}

/// 买入时券商不可达：直接进入 ERROR，不再排队重试
#[tokio::test]
async fn test_broker_offline_at_buy_moves_to_error() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.paper.set_price(SYMBOL, 2600.0).await;
    harness.paper.set_online(false);

    let result = harness.services.engine.execute(&key, OrderAction::Buy).await;
    assert!(matches!(
        result,
        Err(ExecutionError::Broker(BrokerError::NotConnected(_)))
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.paper.place_order_calls(), 0);

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.status, StrategyStatus::Error);
    assert_eq!(state.position, PositionState::None);
    assert!(!state.needs_manual_intervention);

    let records = harness.audit.all().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, Some(ErrorKind::BrokerError));
}

/// 卖出锁被占用时止损卖出直接放弃
#[tokio::test]
async fn test_held_lock_reports_duplicate_order() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.buy_at(&key, 2600.0).await;

    let token = harness
        .locks
        .try_acquire(
            &order_lock_key("s1", OrderAction::Sell),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    assert!(token.is_some());

    let result = harness
        .services
        .engine
        .execute(&key, OrderAction::SlSell)
        .await;
    assert!(matches!(result, Err(ExecutionError::DuplicateOrder { .. })));
    assert_eq!(harness.paper.place_order_calls(), 1);

    let state = harness.state(&key).await.unwrap();
    assert!(!state.sl_triggered);
    assert_eq!(state.position, PositionState::Bought);

    // 止损锁不应被遗留
    let sl_lock = harness
        .locks
        .try_acquire(
            &order_lock_key("s1", OrderAction::SlSell),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    assert!(sl_lock.is_some());
}

/// 停止后的策略不再下单
#[tokio::test]
async fn test_stopped_strategy_rejects_execution() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness
        .services
        .engine
        .stop(&key, "manual")
        .await
        .unwrap();

    harness.paper.set_price(SYMBOL, 2600.0).await;
    let result = harness.services.engine.execute(&key, OrderAction::Buy).await;
    assert!(matches!(result, Err(ExecutionError::Validation(_))));
    assert_eq!(harness.paper.place_order_calls(), 0);

    // 再次激活沿用原有运行时状态
    let restarted = harness
        .services
        .engine
        .activate(&definition("s1", "u1", 2500.0))
        .await
        .unwrap();
    assert_eq!(restarted.status, StrategyStatus::Running);
    assert_eq!(restarted.stop_reason.as_deref(), Some("manual"));
}

/// 挂单在持锁期间等待成交，成交后才写入持仓
#[tokio::test]
async fn test_pending_order_commits_only_after_fill() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.paper.set_price(SYMBOL, 2600.0).await;
    harness.paper.set_pending_polls(3);

    let outcome = harness
        .services
        .engine
        .execute(&key, OrderAction::Buy)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::Executed {
            position: PositionState::Bought,
            ..
        }
    ));
    assert_eq!(harness.paper.status_calls(), 3);
    assert_eq!(harness.paper.place_order_calls(), 1);

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.position, PositionState::Bought);
    assert_relative_eq!(state.entry_price.unwrap(), 2600.0);
}

/// 买入挂单一直不成交：不写入持仓，撤单并转人工
#[tokio::test]
async fn test_unfilled_buy_escalates_without_position() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.paper.set_price(SYMBOL, 2600.0).await;
    harness.paper.set_pending_polls(usize::MAX);

    let result = harness.services.engine.execute(&key, OrderAction::Buy).await;
    assert!(matches!(result, Err(ExecutionError::FillTimeout { .. })));
    assert!(harness.paper.status_calls() > 1);
    assert!(harness.paper.filled_orders().await.is_empty());

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.status, StrategyStatus::Error);
    assert_eq!(state.position, PositionState::None);
    assert!(state.entry_price.is_none());
    assert!(state.needs_manual_intervention);

    let records = harness.audit.all().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Failed);
    assert_eq!(records[0].error_kind, Some(ErrorKind::ExecutionFailure));
}

/// 止损挂单不成交：持仓保持 BOUGHT，不会被当作已完成收尾
#[tokio::test]
async fn test_unfilled_stop_loss_keeps_position_open() {
    let harness = Harness::new();
    let key = harness.activate(definition("s1", "u1", 2500.0)).await;
    harness.buy_at(&key, 2600.0).await;

    harness.paper.set_price(SYMBOL, 2490.0).await;
    harness.paper.set_pending_polls(usize::MAX);
    let result = harness
        .services
        .engine
        .execute(&key, OrderAction::SlSell)
        .await;
    assert!(matches!(result, Err(ExecutionError::FillTimeout { .. })));

    let state = harness.state(&key).await.unwrap();
    assert_eq!(state.status, StrategyStatus::Error);
    assert_eq!(state.position, PositionState::Bought);
    assert!(state.exit_price.is_none());
    assert!(state.realized_pnl.is_none());
    assert!(state.needs_manual_intervention);

    let recent = harness.services.event_bus.recent("u1");
    assert!(recent.iter().all(|e| e.event_type != EventType::StopLossTriggered
        && e.event_type != EventType::StrategyCompleted));
    assert!(recent
        .iter()
        .any(|e| e.event_type == EventType::StrategyError
            && e.payload["kind"] == "ExecutionFailure"));
}
