//! 券商工厂
//!
//! 按名称（大小写不敏感）创建券商适配器，支持注入自定义构造器

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BrokerError;

use super::{AngelOneBroker, BrokerAdapter, DhanBroker, FyersBroker, PaperBroker};

pub type BrokerConstructor =
    Arc<dyn Fn() -> Result<Arc<dyn BrokerAdapter>, BrokerError> + Send + Sync>;

/// 券商注册表
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    constructors: HashMap<String, BrokerConstructor>,
}

impl BrokerRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置 paper / dhan / fyers / angelone（别名 angel_one）
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("paper", || {
            Ok(Arc::new(PaperBroker::new()) as Arc<dyn BrokerAdapter>)
        });
        registry.register("dhan", || {
            Ok(Arc::new(DhanBroker::new()?) as Arc<dyn BrokerAdapter>)
        });
        registry.register("fyers", || {
            Ok(Arc::new(FyersBroker::new()?) as Arc<dyn BrokerAdapter>)
        });
        for name in ["angelone", "angel_one"] {
            registry.register(name, || {
                Ok(Arc::new(AngelOneBroker::new()?) as Arc<dyn BrokerAdapter>)
            });
        }
        registry
    }

    /// 注册（同名覆盖）
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Result<Arc<dyn BrokerAdapter>, BrokerError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_lowercase(), Arc::new(constructor));
    }

    /// 注册一个共享实例，每次创建都返回同一个适配器
    pub fn register_shared(&mut self, name: &str, adapter: Arc<dyn BrokerAdapter>) {
        self.register(name, move || Ok(adapter.clone()));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn BrokerAdapter>, BrokerError> {
        match self.constructors.get(&name.to_lowercase()) {
            Some(constructor) => constructor(),
            None => Err(BrokerError::UnknownBroker(name.to_string())),
        }
    }

    pub fn supports(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_brokers() {
        let registry = BrokerRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec!["angel_one", "angelone", "dhan", "fyers", "paper"]
        );
        assert_eq!(registry.create("PAPER").unwrap().name(), "paper");
        assert_eq!(registry.create("Dhan").unwrap().name(), "dhan");
        assert_eq!(registry.create("FYERS").unwrap().name(), "fyers");
        assert_eq!(registry.create("AngelOne").unwrap().name(), "angelone");
        assert_eq!(registry.create("angel_one").unwrap().name(), "angelone");
    }

    #[test]
    fn test_unsupported_broker() {
        let registry = BrokerRegistry::with_defaults();
        let result = registry.create("zerodha");
        assert!(matches!(result, Err(BrokerError::UnknownBroker(_))));
        assert!(!registry.supports("zerodha"));
    }

    #[test]
    fn test_shared_instance() {
        let shared: Arc<dyn BrokerAdapter> = Arc::new(PaperBroker::new());
        let mut registry = BrokerRegistry::new();
        registry.register_shared("paper", shared.clone());
        let created = registry.create("paper").unwrap();
        assert!(Arc::ptr_eq(&shared, &created));
    }
}
