//! 策略定义存储边界
//!
//! 持久化不在本进程内；这里只定义运行时需要的读写口，以及一个可由 JSON 文件初始化的内存实现。

use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::trading::model::{StrategyDefinition, StrategyRuntimeState, StrategyStatus};

#[async_trait]
pub trait StrategyDefinitionStore: Send + Sync {
    async fn load(&self, strategy_id: &str) -> anyhow::Result<Option<StrategyDefinition>>;

    /// 状态为 RUNNING 的定义，用于对账
    async fn list_running(&self) -> anyhow::Result<Vec<StrategyDefinition>>;

    async fn set_status(&self, strategy_id: &str, status: StrategyStatus) -> anyhow::Result<()>;

    /// 停止/完成/出错时写回最终运行状态
    async fn record_final_state(&self, state: &StrategyRuntimeState) -> anyhow::Result<()>;

    async fn last_final_state(
        &self,
        strategy_id: &str,
    ) -> anyhow::Result<Option<StrategyRuntimeState>>;
}

#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: DashMap<String, StrategyDefinition>,
    final_states: DashMap<String, StrategyRuntimeState>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: StrategyDefinition) {
        self.definitions
            .insert(definition.strategy_id.clone(), definition);
    }

    /// JSON 数组格式
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let definitions: Vec<StrategyDefinition> =
            serde_json::from_str(raw).context("解析策略定义失败")?;
        let store = Self::new();
        for definition in definitions {
            if store.definitions.contains_key(&definition.strategy_id) {
                return Err(anyhow!("策略ID重复: {}", definition.strategy_id));
            }
            store.insert(definition);
        }
        Ok(store)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取策略定义文件失败: {}", path.display()))?;
        let store = Self::from_json_str(&raw)?;
        info!(
            "加载策略定义 {} 条: {}",
            store.definitions.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[async_trait]
impl StrategyDefinitionStore for InMemoryDefinitionStore {
    async fn load(&self, strategy_id: &str) -> anyhow::Result<Option<StrategyDefinition>> {
        Ok(self.definitions.get(strategy_id).map(|d| d.value().clone()))
    }

    async fn list_running(&self) -> anyhow::Result<Vec<StrategyDefinition>> {
        Ok(self
            .definitions
            .iter()
            .filter(|d| d.status == StrategyStatus::Running)
            .map(|d| d.value().clone())
            .collect())
    }

    async fn set_status(&self, strategy_id: &str, status: StrategyStatus) -> anyhow::Result<()> {
        let mut definition = self
            .definitions
            .get_mut(strategy_id)
            .ok_or_else(|| anyhow!("策略定义不存在: {}", strategy_id))?;
        definition.status = status;
        Ok(())
    }

    async fn record_final_state(&self, state: &StrategyRuntimeState) -> anyhow::Result<()> {
        if let Some(mut definition) = self.definitions.get_mut(&state.strategy_id) {
            definition.status = state.status;
        }
        self.final_states
            .insert(state.strategy_id.clone(), state.clone());
        Ok(())
    }

    async fn last_final_state(
        &self,
        strategy_id: &str,
    ) -> anyhow::Result<Option<StrategyRuntimeState>> {
        Ok(self.final_states.get(strategy_id).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"[
        {"strategy_id": "s1", "user_id": "u1", "symbol": "RELIANCE",
         "buy_time": "09:20:00", "sell_time": "15:10:00",
         "stop_loss": 2500.0, "quantity": 10, "broker": "paper"},
        {"strategy_id": "s2", "user_id": "u1", "symbol": "TCS",
         "buy_time": "09:30:00", "sell_time": "15:00:00",
         "stop_loss": 3400.0, "quantity": 5, "broker": "paper", "status": "RUNNING"}
    ]"#;

    #[tokio::test]
    async fn test_seed_from_json() {
        let store = InMemoryDefinitionStore::from_json_str(SEED).unwrap();
        assert_eq!(store.len(), 2);
        let s1 = store.load("s1").await.unwrap().unwrap();
        assert_eq!(s1.status, StrategyStatus::Created);
        let running = store.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].strategy_id, "s2");
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let raw = format!(
            "[{0}, {0}]",
            r#"{"strategy_id": "s1", "user_id": "u1", "symbol": "X", "buy_time": "09:20:00",
                "sell_time": "15:10:00", "stop_loss": 1.0, "quantity": 1, "broker": "paper"}"#
        );
        assert!(InMemoryDefinitionStore::from_json_str(&raw).is_err());
    }

    #[tokio::test]
    async fn test_final_state_updates_definition_status() {
        let store = InMemoryDefinitionStore::from_json_str(SEED).unwrap();
        let definition = store.load("s2").await.unwrap().unwrap();
        let mut state = StrategyRuntimeState::from_definition(&definition, chrono::Utc::now());
        state.status = StrategyStatus::Completed;
        store.record_final_state(&state).await.unwrap();

        assert!(store.list_running().await.unwrap().is_empty());
        let archived = store.last_final_state("s2").await.unwrap().unwrap();
        assert_eq!(archived.status, StrategyStatus::Completed);
    }
}
