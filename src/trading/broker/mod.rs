//! 券商抽象接口
//!
//! 运行时只依赖 `BrokerAdapter`，具体券商由 `BrokerRegistry` 按名称创建。
//! 厂商行情回调统一转成 `FeedMessage` 推入 mpsc 通道。

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::trading::model::{
    BrokerHolding, BrokerPosition, BrokerProfile, FeedMessage, OrderIntent, OrderResult,
};

pub mod angel_one;
pub mod dhan;
pub mod factory;
pub mod fyers;
pub mod ltp_poller;
pub mod paper;
pub mod rest;
pub mod session;

pub use angel_one::AngelOneBroker;
pub use dhan::DhanBroker;
pub use fyers::FyersBroker;
pub use factory::BrokerRegistry;
pub use paper::PaperBroker;
pub use session::{BrokerSessions, CredentialProvider, EnvCredentialProvider, StaticCredentialProvider};

/// 券商登录凭证
///
/// `extra` 存放券商特有的字段，如 angelone 的 api_key / password / totp。
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub client_id: String,
    pub access_token: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl BrokerCredentials {
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: access_token.into(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// 空字符串视为未提供
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.extra.keys().collect();
        keys.sort();
        f.debug_struct("BrokerCredentials")
            .field("client_id", &self.client_id)
            .field("access_token", &"***")
            .field("extra_keys", &keys)
            .finish()
    }
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// 券商名称（小写）
    fn name(&self) -> &'static str;

    async fn connect(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError>;

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult, BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError>;

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError>;

    async fn get_last_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    /// 建立行情连接。返回 Ok 表示已连上，之后的行情与断线通知都推到 `sink`
    async fn stream_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<FeedMessage>,
    ) -> Result<(), BrokerError>;

    /// 在现有行情连接上追加订阅
    async fn subscribe(&self, symbols: &[String]) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), BrokerError>;
}
