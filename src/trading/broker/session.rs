//! 每个 (user, broker) 一个已登录的适配器实例

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::BrokerError;

use super::{BrokerAdapter, BrokerCredentials, BrokerRegistry};

/// 凭证来源（加密存储不在本进程内）
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, user_id: &str, broker: &str)
        -> Result<BrokerCredentials, BrokerError>;
}

/// 从环境变量读取：`{BROKER}_CLIENT_ID` / `{BROKER}_ACCESS_TOKEN`，
/// 以及可选的 `{BROKER}_API_KEY` / `{BROKER}_PASSWORD` / `{BROKER}_TOTP`
///
/// paper 券商不需要凭证。有 password 时 access_token 可以为空。
#[derive(Debug, Default)]
pub struct EnvCredentialProvider;

const EXTRA_ENV_FIELDS: [(&str, &str); 3] = [
    ("API_KEY", "api_key"),
    ("PASSWORD", "password"),
    ("TOTP", "totp"),
];

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn credentials(
        &self,
        _user_id: &str,
        broker: &str,
    ) -> Result<BrokerCredentials, BrokerError> {
        if broker.eq_ignore_ascii_case("paper") {
            return Ok(BrokerCredentials::new("paper", "paper"));
        }
        let prefix = broker.to_ascii_uppercase();
        let var = |suffix: &str| {
            std::env::var(format!("{}_{}", prefix, suffix))
                .ok()
                .filter(|v| !v.is_empty())
        };
        let client_id = match var("CLIENT_ID") {
            Some(id) => id,
            None => return Err(BrokerError::MissingCredentials(broker.to_string())),
        };
        let mut credentials =
            BrokerCredentials::new(client_id, var("ACCESS_TOKEN").unwrap_or_default());
        for (suffix, key) in EXTRA_ENV_FIELDS {
            if let Some(value) = var(suffix) {
                credentials = credentials.with_extra(key, value);
            }
        }
        if credentials.access_token.is_empty() && credentials.extra("password").is_none() {
            return Err(BrokerError::MissingCredentials(broker.to_string()));
        }
        Ok(credentials)
    }
}

/// 固定凭证表，测试与本地使用
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    entries: HashMap<(String, String), BrokerCredentials>,
    fallback: Option<BrokerCredentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 任意用户与券商都返回同一份凭证
    pub fn permissive() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: Some(BrokerCredentials::new("test-client", "test-token")),
        }
    }

    pub fn with(mut self, user_id: &str, broker: &str, credentials: BrokerCredentials) -> Self {
        self.entries
            .insert((user_id.to_string(), broker.to_lowercase()), credentials);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(
        &self,
        user_id: &str,
        broker: &str,
    ) -> Result<BrokerCredentials, BrokerError> {
        self.entries
            .get(&(user_id.to_string(), broker.to_lowercase()))
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| BrokerError::MissingCredentials(format!("{}/{}", user_id, broker)))
    }
}

/// 已登录券商会话缓存
pub struct BrokerSessions {
    registry: BrokerRegistry,
    credentials: Arc<dyn CredentialProvider>,
    sessions: DashMap<(String, String), Arc<dyn BrokerAdapter>>,
    // 串行化登录，避免同一会话重复 connect
    connecting: Mutex<()>,
}

impl BrokerSessions {
    pub fn new(registry: BrokerRegistry, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            registry,
            credentials,
            sessions: DashMap::new(),
            connecting: Mutex::new(()),
        }
    }

    fn session_key(user_id: &str, broker: &str) -> (String, String) {
        (user_id.to_string(), broker.to_lowercase())
    }

    pub fn get(&self, user_id: &str, broker: &str) -> Option<Arc<dyn BrokerAdapter>> {
        self.sessions
            .get(&Self::session_key(user_id, broker))
            .map(|entry| entry.value().clone())
    }

    pub async fn get_or_connect(
        &self,
        user_id: &str,
        broker: &str,
    ) -> Result<Arc<dyn BrokerAdapter>, BrokerError> {
        if let Some(adapter) = self.get(user_id, broker) {
            return Ok(adapter);
        }

        let _guard = self.connecting.lock().await;
        if let Some(adapter) = self.get(user_id, broker) {
            return Ok(adapter);
        }

        let adapter = self.registry.create(broker)?;
        let credentials = self.credentials.credentials(user_id, broker).await?;
        if let Err(e) = adapter.connect(&credentials).await {
            warn!("券商登录失败 user_id={} broker={}: {}", user_id, broker, e);
            return Err(e);
        }
        match adapter.get_profile().await {
            Ok(profile) => info!(
                "券商会话已建立 user_id={} broker={} client_id={}",
                user_id, broker, profile.client_id
            ),
            Err(e) => warn!(
                "券商会话已建立，账户信息获取失败 user_id={} broker={}: {}",
                user_id, broker, e
            ),
        }
        self.sessions
            .insert(Self::session_key(user_id, broker), adapter.clone());
        Ok(adapter)
    }

    /// 丢弃缓存的会话，下次使用时重新登录
    pub fn invalidate(&self, user_id: &str, broker: &str) {
        self.sessions.remove(&Self::session_key(user_id, broker));
    }

    pub fn registry(&self) -> &BrokerRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::broker::PaperBroker;

    #[tokio::test]
    async fn test_session_is_cached_per_user_and_broker() {
        let sessions = BrokerSessions::new(
            BrokerRegistry::with_defaults(),
            Arc::new(StaticCredentialProvider::permissive()),
        );
        let first = sessions.get_or_connect("u1", "paper").await.unwrap();
        let again = sessions.get_or_connect("u1", "PAPER").await.unwrap();
        let other_user = sessions.get_or_connect("u2", "paper").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other_user));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let paper = Arc::new(PaperBroker::new());
        paper.set_online(false);
        let mut registry = BrokerRegistry::new();
        registry.register_shared("paper", paper.clone());
        let sessions =
            BrokerSessions::new(registry, Arc::new(StaticCredentialProvider::permissive()));

        assert!(sessions.get_or_connect("u1", "paper").await.is_err());
        assert!(sessions.get("u1", "paper").is_none());

        paper.set_online(true);
        assert!(sessions.get_or_connect("u1", "paper").await.is_ok());
    }

    #[tokio::test]
    async fn test_env_credentials_with_extras() {
        std::env::set_var("ANGEL_ONE_TEST_CLIENT_ID", "A123456");
        std::env::set_var("ANGEL_ONE_TEST_API_KEY", "key");
        std::env::set_var("ANGEL_ONE_TEST_PASSWORD", "1234");
        std::env::set_var("ANGEL_ONE_TEST_TOTP", "654321");
        let credentials = EnvCredentialProvider
            .credentials("u1", "angel_one_test")
            .await
            .unwrap();
        assert_eq!(credentials.client_id, "A123456");
        assert!(credentials.access_token.is_empty());
        assert_eq!(credentials.extra("api_key"), Some("key"));
        assert_eq!(credentials.extra("totp"), Some("654321"));

        // 既无 token 也无 password
        std::env::set_var("TOKENLESS_TEST_CLIENT_ID", "1000");
        assert!(matches!(
            EnvCredentialProvider.credentials("u1", "tokenless_test").await,
            Err(BrokerError::MissingCredentials(_))
        ));
        assert_eq!(
            EnvCredentialProvider
                .credentials("u1", "paper")
                .await
                .unwrap()
                .client_id,
            "paper"
        );
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let sessions = BrokerSessions::new(
            BrokerRegistry::with_defaults(),
            Arc::new(StaticCredentialProvider::new()),
        );
        assert!(matches!(
            sessions.get_or_connect("u1", "dhan").await,
            Err(BrokerError::MissingCredentials(_))
        ));
        assert!(matches!(
            sessions.get_or_connect("u1", "zerodha").await,
            Err(BrokerError::UnknownBroker(_))
        ));
    }
}
