//! 下单审计记录
//!
//! 每次 execute 调用无论成败都会落一条记录

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::trading::model::keys::audit_key;
use crate::trading::model::{OrderAction, StrategyKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Filled,
    /// 锁内复核发现前置条件已不满足
    NoOp,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub attempt_id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub action: OrderAction,
    /// 实际调用券商的次数
    pub attempts: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub outcome: AuditOutcome,
    pub broker_order_id: Option<String>,
    pub fill_price: Option<f64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl AuditRecord {
    pub fn begin(key: &StrategyKey, symbol: &str, action: OrderAction) -> Self {
        let now = Utc::now();
        Self {
            attempt_id: Uuid::new_v4().to_string(),
            user_id: key.user_id.clone(),
            strategy_id: key.strategy_id.clone(),
            symbol: symbol.to_string(),
            action,
            attempts: 0,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            outcome: AuditOutcome::Failed,
            broker_order_id: None,
            fill_price: None,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn filled(mut self, broker_order_id: &str, fill_price: f64) -> Self {
        self.outcome = AuditOutcome::Filled;
        self.broker_order_id = Some(broker_order_id.to_string());
        self.fill_price = Some(fill_price);
        self.finish()
    }

    pub fn no_op(mut self, reason: &str) -> Self {
        self.outcome = AuditOutcome::NoOp;
        self.error_message = Some(reason.to_string());
        self.finish()
    }

    pub fn failed(mut self, kind: ErrorKind, message: &str) -> Self {
        self.outcome = AuditOutcome::Failed;
        self.error_kind = Some(kind);
        self.error_message = Some(message.to_string());
        self.finish()
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at).num_milliseconds();
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()>;

    /// 按时间先后返回
    async fn records_for(&self, strategy_id: &str) -> anyhow::Result<Vec<AuditRecord>>;
}

#[derive(Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn records_for(&self, strategy_id: &str) -> anyhow::Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.strategy_id == strategy_id)
            .cloned()
            .collect())
    }
}

/// Redis 列表 `audit:orders:{strategy_id}`，保留最近 max_len 条
pub struct RedisAuditSink {
    conn: MultiplexedConnection,
    max_len: isize,
}

impl RedisAuditSink {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            max_len: 1000,
        }
    }
}

#[async_trait]
impl AuditSink for RedisAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = audit_key(&record.strategy_id);
        let payload = serde_json::to_string(&record)?;
        let _: () = redis::pipe()
            .lpush(&key, payload)
            .ignore()
            .ltrim(&key, 0, self.max_len - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn records_for(&self, strategy_id: &str) -> anyhow::Result<Vec<AuditRecord>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(audit_key(strategy_id), 0, -1).await?;
        // LPUSH 写入，新记录在前
        raw.iter()
            .rev()
            .map(|s| serde_json::from_str(s).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_are_filtered_by_strategy() {
        let sink = InMemoryAuditSink::new();
        let key = StrategyKey::new("u1", "s1");
        sink.record(AuditRecord::begin(&key, "TCS", OrderAction::Buy).filled("P-1", 3500.0))
            .await
            .unwrap();
        sink.record(
            AuditRecord::begin(&StrategyKey::new("u1", "s2"), "TCS", OrderAction::Buy)
                .failed(ErrorKind::DuplicateOrder, "locked"),
        )
        .await
        .unwrap();

        let records = sink.records_for("s1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Filled);
        assert_eq!(records[0].broker_order_id.as_deref(), Some("P-1"));
        assert!(records[0].duration_ms >= 0);
    }
}
