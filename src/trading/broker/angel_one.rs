//! Angel One SmartAPI REST 适配器
//!
//! symbol 形如 `SBIN-EQ:3045`（交易代码:合约 token），下单与查价都需要两者。
//! 凭证带 password 时用 clientcode + password + totp 换 JWT，否则把 access_token 当作 JWT。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::RequestBuilder;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::app_config::env::env_or_default;
use crate::error::BrokerError;
use crate::trading::market::normalizer::value_as_f64;
use crate::trading::model::{
    BrokerHolding, BrokerPosition, BrokerProfile, FeedMessage, OrderIntent, OrderResult,
    OrderStatus,
};

use super::ltp_poller::{LtpPoller, LtpSource};
use super::rest::{build_client, send_json, value_as_id, value_as_i64};
use super::{BrokerAdapter, BrokerCredentials};

const DEFAULT_BASE_URL: &str = "https://apiconnect.angelone.in";
const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
const SECURE_PREFIX: &str = "/rest/secure/angelbroking";
const EXCHANGE: &str = "NSE";
const VARIETY: &str = "NORMAL";
/// AG8001 / AG8002 / AG8003 为 token 失效
const TOKEN_ERRORS: [&str; 3] = ["AG8001", "AG8002", "AG8003"];

struct AngelSession {
    client_code: String,
    api_key: String,
    jwt: String,
}

struct AngelInner {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    session: RwLock<Option<AngelSession>>,
}

pub struct AngelOneBroker {
    inner: Arc<AngelInner>,
    feed: LtpPoller,
}

impl AngelOneBroker {
    /// 默认地址可用 ANGELONE_BASE_URL 覆盖
    pub fn new() -> Result<Self, BrokerError> {
        Self::with_base_url(
            env_or_default("ANGELONE_BASE_URL", DEFAULT_BASE_URL),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            inner: Arc::new(AngelInner {
                http: build_client(timeout)?,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                timeout,
                session: RwLock::new(None),
            }),
            feed: LtpPoller::new("angelone", poll_interval),
        })
    }
}

/// `TRADINGSYMBOL:TOKEN` -> (tradingsymbol, symboltoken)
fn split_symbol(symbol: &str) -> Result<(&str, &str), BrokerError> {
    match symbol.rsplit_once(':') {
        Some((trading_symbol, token)) if !trading_symbol.is_empty() && !token.is_empty() => {
            Ok((trading_symbol, token))
        }
        _ => Err(BrokerError::Rejected(format!(
            "angelone symbol 需为 TRADINGSYMBOL:TOKEN 格式: {}",
            symbol
        ))),
    }
}

fn with_headers(request: RequestBuilder, api_key: &str) -> RequestBuilder {
    request
        .header("Accept", "application/json")
        .header("X-UserType", "USER")
        .header("X-SourceID", "WEB")
        .header("X-ClientLocalIP", "127.0.0.1")
        .header("X-ClientPublicIP", "127.0.0.1")
        .header("X-MACAddress", "00:00:00:00:00:00")
        .header("X-PrivateKey", api_key)
}

impl AngelInner {
    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, SECURE_PREFIX, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, BrokerError> {
        let request = {
            let session = self.session.read().await;
            let session = session
                .as_ref()
                .ok_or_else(|| BrokerError::NotConnected("angelone 未登录".to_string()))?;
            with_headers(request, &session.api_key).bearer_auth(&session.jwt)
        };
        let response = send_json(request, self.timeout).await?;
        check_envelope(response)
            .map(|mut body| body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    async fn login(
        &self,
        credentials: &BrokerCredentials,
        api_key: &str,
    ) -> Result<String, BrokerError> {
        let payload = json!({
            "clientcode": credentials.client_id,
            "password": credentials.extra("password").unwrap_or_default(),
            "totp": credentials.extra("totp").unwrap_or_default(),
        });
        let request = with_headers(
            self.http.post(format!("{}{}", self.base_url, LOGIN_PATH)),
            api_key,
        )
        .json(&payload);
        let body = check_envelope(send_json(request, self.timeout).await?)?;
        body["data"]["jwtToken"]
            .as_str()
            .filter(|jwt| !jwt.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Transient("登录响应缺少 jwtToken".to_string()))
    }

    async fn ltp(&self, symbol: &str) -> Result<f64, BrokerError> {
        let (trading_symbol, token) = split_symbol(symbol)?;
        let payload = json!({
            "exchange": EXCHANGE,
            "tradingsymbol": trading_symbol,
            "symboltoken": token,
        });
        let data = self
            .send(self.http.post(self.url("/order/v1/getLtpData")).json(&payload))
            .await?;
        value_as_f64(&data["ltp"])
            .filter(|price| *price > 0.0)
            .ok_or_else(|| BrokerError::Rejected(format!("无最新价: {}", symbol)))
    }
}

#[async_trait]
impl LtpSource for AngelInner {
    /// 逐个 symbol 查价；全部失败时返回最后一个错误
    async fn last_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        let results = join_all(symbols.iter().map(|symbol| self.ltp(symbol))).await;
        let mut prices = HashMap::new();
        let mut last_error = None;
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(price) => {
                    prices.insert(symbol.clone(), price);
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) if prices.is_empty() => Err(e),
            _ => Ok(prices),
        }
    }
}

fn check_envelope(value: Value) -> Result<Value, BrokerError> {
    if value["status"].as_bool() == Some(true) {
        return Ok(value);
    }
    let code = value["errorcode"].as_str().unwrap_or_default();
    let message = value["message"].as_str().unwrap_or("未知错误");
    if TOKEN_ERRORS.contains(&code) {
        return Err(BrokerError::NotConnected(format!("angelone {} {}", code, message)));
    }
    Err(BrokerError::Rejected(format!("angelone {} {}", code, message)))
}

fn parse_order_status(value: &str) -> OrderStatus {
    match value.to_ascii_lowercase().as_str() {
        "complete" => OrderStatus::Filled,
        "rejected" => OrderStatus::Rejected,
        "cancelled" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(value: &Value) -> Option<OrderResult> {
    let broker_order_id = value_as_id(&value["orderid"])?;
    let status = value["status"]
        .as_str()
        .or_else(|| value["orderstatus"].as_str())
        .map(parse_order_status)
        .unwrap_or(OrderStatus::Pending);
    let fill_price = value_as_f64(&value["averageprice"]).filter(|price| *price > 0.0);
    let error = value["text"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(OrderResult {
        broker_order_id,
        status,
        fill_price,
        error,
    })
}

fn parse_position(value: &Value) -> Option<BrokerPosition> {
    let trading_symbol = value["tradingsymbol"].as_str()?;
    let symbol = match value["symboltoken"].as_str() {
        Some(token) => format!("{}:{}", trading_symbol, token),
        None => trading_symbol.to_string(),
    };
    Some(BrokerPosition {
        symbol,
        quantity: value_as_i64(&value["netqty"])?,
        average_price: ["avgnetprice", "buyavgprice"]
            .iter()
            .filter_map(|field| value_as_f64(&value[*field]))
            .find(|price| *price > 0.0),
    })
}

fn parse_holding(value: &Value) -> Option<BrokerHolding> {
    let trading_symbol = value["tradingsymbol"].as_str()?;
    let symbol = match value["symboltoken"].as_str() {
        Some(token) => format!("{}:{}", trading_symbol, token),
        None => trading_symbol.to_string(),
    };
    Some(BrokerHolding {
        symbol,
        quantity: value_as_i64(&value["quantity"])?,
        average_price: value_as_f64(&value["averageprice"]).filter(|p| *p > 0.0),
    })
}

fn parse_profile(value: &Value) -> Option<BrokerProfile> {
    Some(BrokerProfile {
        client_id: value_as_id(&value["clientcode"])?,
        name: value["name"].as_str().map(str::to_string),
        email: value["email"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

fn data_rows(data: &Value) -> impl Iterator<Item = &Value> {
    data.as_array().into_iter().flatten()
}

#[async_trait]
impl BrokerAdapter for AngelOneBroker {
    fn name(&self) -> &'static str {
        "angelone"
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError> {
        let api_key = credentials.extra("api_key");
        let has_password = credentials.extra("password").is_some();
        let api_key = match api_key {
            Some(key)
                if !credentials.client_id.is_empty()
                    && (has_password || !credentials.access_token.is_empty()) =>
            {
                key.to_string()
            }
            _ => return Err(BrokerError::MissingCredentials("angelone".to_string())),
        };
        let jwt = if has_password {
            self.inner.login(credentials, &api_key).await?
        } else {
            credentials.access_token.clone()
        };
        *self.inner.session.write().await = Some(AngelSession {
            client_code: credentials.client_id.clone(),
            api_key,
            jwt,
        });
        info!("angelone 券商已登录: client_code={}", credentials.client_id);
        Ok(())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult, BrokerError> {
        let inner = &self.inner;
        let (trading_symbol, token) = split_symbol(&intent.symbol)?;
        let order_type = if intent.limit_price.is_some() {
            "LIMIT"
        } else {
            "MARKET"
        };
        let payload = json!({
            "variety": VARIETY,
            "tradingsymbol": trading_symbol,
            "symboltoken": token,
            "transactiontype": intent.side.as_str(),
            "exchange": EXCHANGE,
            "ordertype": order_type,
            "producttype": "INTRADAY",
            "duration": "DAY",
            "price": intent.limit_price.unwrap_or(0.0).to_string(),
            "squareoff": "0",
            "stoploss": "0",
            "quantity": intent.quantity.to_string(),
        });
        let data = inner
            .send(inner.http.post(inner.url("/order/v1/placeOrder")).json(&payload))
            .await?;
        let broker_order_id = value_as_id(&data["orderid"])
            .ok_or_else(|| BrokerError::Transient(format!("响应缺少 orderid: {}", data)))?;

        // 下单回包只有订单号，补查一次订单簿
        let result = match self.get_order_status(&broker_order_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("angelone 查询订单失败 order_id={}: {}", broker_order_id, e);
                OrderResult {
                    broker_order_id,
                    status: OrderStatus::Pending,
                    fill_price: None,
                    error: None,
                }
            }
        };
        debug!("angelone 下单结果: {:?}", result);
        Ok(result)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let payload = json!({ "variety": VARIETY, "orderid": broker_order_id });
        inner
            .send(inner.http.post(inner.url("/order/v1/cancelOrder")).json(&payload))
            .await?;
        Ok(())
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError> {
        let inner = &self.inner;
        let data = inner
            .send(inner.http.get(inner.url("/order/v1/getOrderBook")))
            .await?;
        let result = data_rows(&data)
            .filter_map(parse_order)
            .find(|order| order.broker_order_id == broker_order_id)
            .ok_or_else(|| BrokerError::Rejected(format!("订单不存在: {}", broker_order_id)));
        result
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let inner = &self.inner;
        let data = inner
            .send(inner.http.get(inner.url("/order/v1/getPosition")))
            .await?;
        Ok(data_rows(&data).filter_map(parse_position).collect())
    }

    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError> {
        let inner = &self.inner;
        let data = inner
            .send(inner.http.get(inner.url("/portfolio/v1/getHolding")))
            .await?;
        Ok(data_rows(&data).filter_map(parse_holding).collect())
    }

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
        let inner = &self.inner;
        let data = inner
            .send(inner.http.get(inner.url("/user/v1/getProfile")))
            .await?;
        if let Some(profile) = parse_profile(&data) {
            return Ok(profile);
        }
        // 部分账户的 profile 不带 clientcode
        let session = inner.session.read().await;
        session
            .as_ref()
            .map(|s| BrokerProfile {
                client_id: s.client_code.clone(),
                name: data["name"].as_str().map(str::to_string),
                email: None,
            })
            .ok_or_else(|| BrokerError::NotConnected("angelone 未登录".to_string()))
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.inner.ltp(symbol).await
    }

    async fn stream_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<FeedMessage>,
    ) -> Result<(), BrokerError> {
        if self.inner.session.read().await.is_none() {
            return Err(BrokerError::NotConnected("angelone 未登录".to_string()));
        }
        let source: Arc<dyn LtpSource> = self.inner.clone();
        self.feed.start(source, symbols, sink).await;
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), BrokerError> {
        self.feed.subscribe(symbols).await;
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), BrokerError> {
        self.feed.unsubscribe(symbols).await;
        Ok(())
    }
}
