//! Fyers v3 REST 适配器
//!
//! 响应统一带 `s` 字段，"ok" 以外都按拒单处理。symbol 形如 `NSE:SBIN-EQ`。

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
    OrderSide, OrderStatus,
};

use super::ltp_poller::{LtpPoller, LtpSource};
use super::rest::{build_client, send_json, value_as_id, value_as_i64};
use super::{BrokerAdapter, BrokerCredentials};

const DEFAULT_BASE_URL: &str = "https://api-t1.fyers.in/api/v3";
const DEFAULT_DATA_URL: &str = "https://api-t1.fyers.in/data";

/// 订单类型：1 限价 2 市价
const ORDER_TYPE_LIMIT: i64 = 1;
const ORDER_TYPE_MARKET: i64 = 2;

struct FyersInner {
    http: reqwest::Client,
    base_url: String,
    data_url: String,
    timeout: Duration,
    credentials: RwLock<Option<BrokerCredentials>>,
}

pub struct FyersBroker {
    inner: Arc<FyersInner>,
    feed: LtpPoller,
}

impl FyersBroker {
    /// 默认地址可用 FYERS_BASE_URL / FYERS_DATA_URL 覆盖
    pub fn new() -> Result<Self, BrokerError> {
        Self::with_urls(
            env_or_default("FYERS_BASE_URL", DEFAULT_BASE_URL),
            env_or_default("FYERS_DATA_URL", DEFAULT_DATA_URL),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    pub fn with_urls(
        base_url: impl Into<String>,
        data_url: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            inner: Arc::new(FyersInner {
                http: build_client(timeout)?,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                data_url: data_url.into().trim_end_matches('/').to_string(),
                timeout,
                credentials: RwLock::new(None),
            }),
            feed: LtpPoller::new("fyers", poll_interval),
        })
    }
}

impl FyersInner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, BrokerError> {
        let authorization = {
            let credentials = self.credentials.read().await;
            let credentials = credentials
                .as_ref()
                .ok_or_else(|| BrokerError::NotConnected("fyers 未登录".to_string()))?;
            format!("{}:{}", credentials.client_id, credentials.access_token)
        };
        let response =
            send_json(request.header("Authorization", authorization), self.timeout).await?;
        check_envelope(response)
    }
}

#[async_trait]
impl LtpSource for FyersInner {
    async fn last_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        let url = format!("{}/quotes", self.data_url);
        let response = self
            .send(self.http.get(url).query(&[("symbols", symbols.join(","))]))
            .await?;
        Ok(parse_quotes(&response))
    }
}

fn check_envelope(value: Value) -> Result<Value, BrokerError> {
    if value["s"].as_str() == Some("ok") {
        return Ok(value);
    }
    let code = value["code"].as_i64().unwrap_or_default();
    let message = value["message"].as_str().unwrap_or("未知错误");
    // -8 / -15 / -16 / -17 为 token 失效
    if matches!(code, -8 | -15 | -16 | -17) {
        return Err(BrokerError::NotConnected(format!("fyers {} {}", code, message)));
    }
    Err(BrokerError::Rejected(format!("fyers {} {}", code, message)))
}

/// 2 成交，1 撤单，5 拒单，7 过期，其余（4 传输中、6 挂单）视为未决
fn parse_order_status(code: i64) -> OrderStatus {
    match code {
        2 => OrderStatus::Filled,
        5 => OrderStatus::Rejected,
        1 | 7 => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(value: &Value) -> Option<OrderResult> {
    let broker_order_id = value_as_id(&value["id"])?;
    let status = value_as_i64(&value["status"])
        .map(parse_order_status)
        .unwrap_or(OrderStatus::Pending);
    let fill_price = ["tradedPrice", "limitPrice"]
        .iter()
        .filter_map(|field| value_as_f64(&value[*field]))
        .find(|price| *price > 0.0);
    let error = match status {
        OrderStatus::Rejected | OrderStatus::Cancelled => value["message"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    };
    Some(OrderResult {
        broker_order_id,
        status,
        fill_price,
        error,
    })
}

fn parse_quotes(value: &Value) -> HashMap<String, f64> {
    value["d"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter(|row| row["s"].as_str() == Some("ok"))
                .filter_map(|row| {
                    let symbol = row["n"].as_str()?.to_string();
                    let price = value_as_f64(&row["v"]["lp"])?;
                    Some((symbol, price))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_position(value: &Value) -> Option<BrokerPosition> {
    Some(BrokerPosition {
        symbol: value["symbol"].as_str()?.to_string(),
        quantity: value_as_i64(&value["netQty"])?,
        average_price: ["netAvg", "buyAvg"]
            .iter()
            .filter_map(|field| value_as_f64(&value[*field]))
            .find(|price| *price > 0.0),
    })
}

fn parse_holding(value: &Value) -> Option<BrokerHolding> {
    Some(BrokerHolding {
        symbol: value["symbol"].as_str()?.to_string(),
        quantity: value_as_i64(&value["quantity"])?,
        average_price: value_as_f64(&value["costPrice"]).filter(|p| *p > 0.0),
    })
}

fn parse_profile(value: &Value) -> Option<BrokerProfile> {
    let data = &value["data"];
    Some(BrokerProfile {
        client_id: value_as_id(&data["fy_id"])?,
        name: data["name"].as_str().map(str::to_string),
        email: data["email_id"].as_str().map(str::to_string),
    })
}

fn rows<'a>(value: &'a Value, field: &str) -> impl Iterator<Item = &'a Value> {
    value[field].as_array().into_iter().flatten()
}

#[async_trait]
impl BrokerAdapter for FyersBroker {
    fn name(&self) -> &'static str {
        "fyers"
    }

    /// 登录后拉一次账户信息验证 token
    async fn connect(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError> {
        if credentials.client_id.is_empty() || credentials.access_token.is_empty() {
            return Err(BrokerError::MissingCredentials("fyers".to_string()));
        }
        *self.inner.credentials.write().await = Some(credentials.clone());
        match self.get_profile().await {
            Ok(profile) => {
                info!("fyers 券商已登录: client_id={}", profile.client_id);
                Ok(())
            }
            Err(e) => {
                *self.inner.credentials.write().await = None;
                Err(e)
            }
        }
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult, BrokerError> {
        let inner = &self.inner;
        let side = match intent.side {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        };
        let order_type = if intent.limit_price.is_some() {
            ORDER_TYPE_LIMIT
        } else {
            ORDER_TYPE_MARKET
        };
        let payload = json!({
            "symbol": intent.symbol,
            "qty": intent.quantity,
            "type": order_type,
            "side": side,
            "productType": "INTRADAY",
            "limitPrice": intent.limit_price.unwrap_or(0.0),
            "stopPrice": 0,
            "validity": "DAY",
            "disclosedQty": 0,
            "offlineOrder": false,
        });
        let response = inner
            .send(inner.http.post(inner.url("/orders/sync")).json(&payload))
            .await?;
        let broker_order_id = value_as_id(&response["id"])
            .ok_or_else(|| BrokerError::Transient(format!("响应缺少 id: {}", response)))?;

        // 下单回包不带状态与成交价，补查一次订单
        let result = match self.get_order_status(&broker_order_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("fyers 查询订单失败 order_id={}: {}", broker_order_id, e);
                OrderResult {
                    broker_order_id,
                    status: OrderStatus::Pending,
                    fill_price: None,
                    error: None,
                }
            }
        };
        debug!("fyers 下单结果: {:?}", result);
        Ok(result)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let inner = &self.inner;
        inner
            .send(
                inner
                    .http
                    .delete(inner.url("/orders/sync"))
                    .json(&json!({ "id": broker_order_id })),
            )
            .await?;
        Ok(())
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError> {
        let inner = &self.inner;
        let response = inner
            .send(inner.http.get(inner.url("/orders")).query(&[("id", broker_order_id)]))
            .await?;
        let result = rows(&response, "orderBook")
            .filter_map(parse_order)
            .find(|order| order.broker_order_id == broker_order_id)
            .ok_or_else(|| BrokerError::Rejected(format!("订单不存在: {}", broker_order_id)));
        result
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let inner = &self.inner;
        let response = inner.send(inner.http.get(inner.url("/positions"))).await?;
        Ok(rows(&response, "netPositions").filter_map(parse_position).collect())
    }

    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError> {
        let inner = &self.inner;
        let response = inner.send(inner.http.get(inner.url("/holdings"))).await?;
        Ok(rows(&response, "holdings").filter_map(parse_holding).collect())
    }

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
        let inner = &self.inner;
        let response = inner.send(inner.http.get(inner.url("/profile"))).await?;
        parse_profile(&response)
            .ok_or_else(|| BrokerError::Transient(format!("账户信息解析失败: {}", response)))
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
        if self.inner.credentials.read().await.is_none() {
            return Err(BrokerError::NotConnected("fyers 未登录".to_string()));
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
