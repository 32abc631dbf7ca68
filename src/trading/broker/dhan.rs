//! Dhan 券商 REST 适配器
//!
//! 下单/撤单/查单/持仓走 REST；行情为按间隔轮询 LTP 的简易推送

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
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

const DEFAULT_BASE_URL: &str = "https://api.dhan.co";
const EXCHANGE_SEGMENT: &str = "NSE_EQ";

struct DhanInner {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    credentials: RwLock<Option<BrokerCredentials>>,
}

pub struct DhanBroker {
    inner: Arc<DhanInner>,
    feed: LtpPoller,
}

impl DhanBroker {
    /// 默认地址可用 DHAN_BASE_URL 覆盖
    pub fn new() -> Result<Self, BrokerError> {
        Self::with_base_url(
            env_or_default("DHAN_BASE_URL", DEFAULT_BASE_URL),
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
            inner: Arc::new(DhanInner {
                http: build_client(timeout)?,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                timeout,
                credentials: RwLock::new(None),
            }),
            feed: LtpPoller::new("dhan", poll_interval),
        })
    }
}

impl DhanInner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, BrokerError> {
        let credentials = self.credentials.read().await;
        let credentials = credentials
            .as_ref()
            .ok_or_else(|| BrokerError::NotConnected("dhan 未登录".to_string()))?;
        Ok(request
            .header("X-Client-Id", &credentials.client_id)
            .header("X-Dhan-Client-Token", &credentials.access_token))
    }

    async fn client_id(&self) -> Result<String, BrokerError> {
        self.credentials
            .read()
            .await
            .as_ref()
            .map(|c| c.client_id.clone())
            .ok_or_else(|| BrokerError::NotConnected("dhan 未登录".to_string()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, BrokerError> {
        let request = self.authorized(request).await?;
        send_json(request, self.timeout).await
    }
}

#[async_trait]
impl LtpSource for DhanInner {
    async fn last_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        let ids: Vec<Value> = symbols
            .iter()
            .map(|s| s.parse::<u64>().map(Value::from).unwrap_or_else(|_| json!(s)))
            .collect();
        let body = json!({ EXCHANGE_SEGMENT: ids });
        let response = self
            .send(self.http.post(self.url("/marketfeed/ltp")).json(&body))
            .await?;
        Ok(parse_ltp_response(&response))
    }
}

fn parse_order_status(value: &str) -> OrderStatus {
    match value.to_ascii_uppercase().as_str() {
        "TRADED" | "FILLED" | "COMPLETE" => OrderStatus::Filled,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELLED" | "EXPIRED" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn parse_order_result(value: &Value) -> Result<OrderResult, BrokerError> {
    let broker_order_id = value_as_id(&value["orderId"])
        .ok_or_else(|| BrokerError::Transient(format!("响应缺少 orderId: {}", value)))?;
    let status = value["orderStatus"]
        .as_str()
        .map(parse_order_status)
        .unwrap_or(OrderStatus::Pending);
    let fill_price = ["averageTradedPrice", "tradedPrice", "price"]
        .iter()
        .filter_map(|field| value_as_f64(&value[*field]))
        .find(|price| *price > 0.0);
    let error = value["omsErrorDescription"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok(OrderResult {
        broker_order_id,
        status,
        fill_price,
        error,
    })
}

fn parse_ltp_response(value: &Value) -> HashMap<String, f64> {
    let mut prices = HashMap::new();
    if let Some(segment) = value["data"][EXCHANGE_SEGMENT].as_object() {
        for (security_id, quote) in segment {
            if let Some(price) = value_as_f64(&quote["last_price"]) {
                prices.insert(security_id.clone(), price);
            }
        }
    }
    prices
}

fn parse_position(value: &Value) -> Option<BrokerPosition> {
    let symbol = value["tradingSymbol"]
        .as_str()
        .or_else(|| value["securityId"].as_str())?
        .to_string();
    let quantity = value_as_i64(&value["netQty"])?;
    let average_price = ["buyAvg", "costPrice"]
        .iter()
        .filter_map(|field| value_as_f64(&value[*field]))
        .find(|price| *price > 0.0);
    Some(BrokerPosition {
        symbol,
        quantity,
        average_price,
    })
}

fn parse_holding(value: &Value) -> Option<BrokerHolding> {
    let symbol = value["tradingSymbol"]
        .as_str()
        .or_else(|| value["securityId"].as_str())?
        .to_string();
    let quantity =
        value_as_i64(&value["totalQty"]).or_else(|| value_as_i64(&value["availableQty"]))?;
    Some(BrokerHolding {
        symbol,
        quantity,
        average_price: value_as_f64(&value["avgCostPrice"]).filter(|p| *p > 0.0),
    })
}

fn parse_profile(value: &Value, fallback_client_id: &str) -> BrokerProfile {
    BrokerProfile {
        client_id: value_as_id(&value["dhanClientId"])
            .unwrap_or_else(|| fallback_client_id.to_string()),
        name: None,
        email: None,
    }
}

#[async_trait]
impl BrokerAdapter for DhanBroker {
    fn name(&self) -> &'static str {
        "dhan"
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError> {
        if credentials.client_id.is_empty() || credentials.access_token.is_empty() {
            return Err(BrokerError::MissingCredentials("dhan".to_string()));
        }
        *self.inner.credentials.write().await = Some(credentials.clone());
        info!("dhan 券商已登录: client_id={}", credentials.client_id);
        Ok(())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult, BrokerError> {
        let inner = &self.inner;
        let order_type = if intent.limit_price.is_some() {
            "LIMIT"
        } else {
            "MARKET"
        };
        let payload = json!({
            "dhanClientId": inner.client_id().await?,
            "correlationId": intent.client_order_id,
            "transactionType": intent.side.as_str(),
            "exchangeSegment": EXCHANGE_SEGMENT,
            "productType": "INTRADAY",
            "securityId": intent.symbol,
            "quantity": intent.quantity,
            "orderType": order_type,
            "price": intent.limit_price.unwrap_or(0.0),
            "validity": "DAY",
        });
        let response = inner
            .send(inner.http.post(inner.url("/orders")).json(&payload))
            .await?;
        let mut result = parse_order_result(&response)?;

        // 市价单回包通常不带成交价，补查一次订单
        if result.fill_price.is_none() && result.status != OrderStatus::Rejected {
            match self.get_order_status(&result.broker_order_id).await {
                Ok(latest) => result = latest,
                Err(e) => warn!("dhan 查询成交价失败 order_id={}: {}", result.broker_order_id, e),
            }
        }
        debug!("dhan 下单结果: {:?}", result);
        Ok(result)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let inner = &self.inner;
        inner
            .send(inner.http.delete(inner.url(&format!("/orders/{}", broker_order_id))))
            .await?;
        Ok(())
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError> {
        let inner = &self.inner;
        let response = inner
            .send(inner.http.get(inner.url(&format!("/orders/{}", broker_order_id))))
            .await?;
        parse_order_result(&response)
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let inner = &self.inner;
        let response = inner.send(inner.http.get(inner.url("/positions"))).await?;
        Ok(response
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_position).collect())
            .unwrap_or_default())
    }

    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError> {
        let inner = &self.inner;
        let response = inner.send(inner.http.get(inner.url("/holdings"))).await?;
        Ok(response
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_holding).collect())
            .unwrap_or_default())
    }

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
        let inner = &self.inner;
        let client_id = inner.client_id().await?;
        let response = inner.send(inner.http.get(inner.url("/profile"))).await?;
        Ok(parse_profile(&response, &client_id))
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let prices = self.inner.last_prices(&[symbol.to_string()]).await?;
        prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Rejected(format!("无最新价: {}", symbol)))
    }

    async fn stream_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<FeedMessage>,
    ) -> Result<(), BrokerError> {
        // 先确认已登录
        self.inner.client_id().await?;
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
