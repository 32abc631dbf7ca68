use std::collections::{HashMap, HashSet};

use crate::trading::model::StrategyKey;

/// 行情订阅引用计数：symbol -> 正在使用它的策略集合
///
/// 同一策略重复登记只计一次。
#[derive(Debug, Default)]
pub struct SymbolSubscriptions {
    consumers: HashMap<String, HashSet<StrategyKey>>,
}

impl SymbolSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 true 表示这是该 symbol 的第一个使用者，需要向券商订阅
    pub fn add(&mut self, symbol: &str, consumer: &StrategyKey) -> bool {
        let set = self.consumers.entry(symbol.to_string()).or_default();
        let first = set.is_empty();
        set.insert(consumer.clone());
        first
    }

    /// 返回 true 表示最后一个使用者已离开，需要退订
    pub fn remove(&mut self, symbol: &str, consumer: &StrategyKey) -> bool {
        let Some(set) = self.consumers.get_mut(symbol) else {
            return false;
        };
        if !set.remove(consumer) {
            return false;
        }
        if set.is_empty() {
            self.consumers.remove(symbol);
            return true;
        }
        false
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.consumers.contains_key(symbol)
    }

    pub fn ref_count(&self, symbol: &str) -> usize {
        self.consumers.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.consumers.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// 使用该 symbol 的策略
    pub fn consumers_of(&self, symbol: &str) -> Vec<StrategyKey> {
        self.consumers
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 所有依赖该连接的策略
    pub fn consumers(&self) -> Vec<StrategyKey> {
        let mut all: Vec<StrategyKey> = self
            .consumers
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        all.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        all
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_counting() {
        let mut subs = SymbolSubscriptions::new();
        let a = StrategyKey::new("u1", "a");
        let b = StrategyKey::new("u1", "b");

        assert!(subs.add("RELIANCE", &a));
        assert!(!subs.add("RELIANCE", &b));
        assert!(!subs.add("RELIANCE", &a));
        assert_eq!(subs.ref_count("RELIANCE"), 2);

        assert!(!subs.remove("RELIANCE", &a));
        assert!(!subs.remove("RELIANCE", &a));
        assert!(subs.contains("RELIANCE"));
        assert!(subs.remove("RELIANCE", &b));
        assert!(!subs.contains("RELIANCE"));
        assert!(subs.is_empty());
        assert!(!subs.remove("TCS", &a));
    }

    #[test]
    fn test_consumers_are_deduplicated() {
        let mut subs = SymbolSubscriptions::new();
        let a = StrategyKey::new("u1", "a");
        subs.add("RELIANCE", &a);
        subs.add("TCS", &a);
        subs.add("TCS", &StrategyKey::new("u1", "b"));
        assert_eq!(subs.consumers().len(), 2);
        assert_eq!(subs.consumers_of("RELIANCE"), vec![a.clone()]);
        assert_eq!(subs.consumers_of("TCS").len(), 2);
        assert!(subs.consumers_of("INFY").is_empty());
        assert_eq!(subs.symbols(), vec!["RELIANCE".to_string(), "TCS".to_string()]);
    }
}
