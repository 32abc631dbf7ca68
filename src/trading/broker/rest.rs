//! REST 券商共用的 HTTP 辅助

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use crate::error::BrokerError;

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, BrokerError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BrokerError::Transient(format!("创建 HTTP 客户端失败: {}", e)))
}

/// 4xx 视为拒单，其余视为临时错误
pub fn map_http_error(status: StatusCode, body: &str) -> BrokerError {
    if status.is_client_error() {
        BrokerError::Rejected(format!("{} {}", status, body))
    } else {
        BrokerError::Transient(format!("{} {}", status, body))
    }
}

pub fn transport_error(e: reqwest::Error, timeout: Duration) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout(timeout)
    } else {
        BrokerError::Transient(e.to_string())
    }
}

/// 发送请求并解析 JSON；空响应体返回 Null
pub async fn send_json(request: RequestBuilder, timeout: Duration) -> Result<Value, BrokerError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(e, timeout))?;
    if !status.is_success() {
        return Err(map_http_error(status, &body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| BrokerError::Transient(format!("响应解析失败: {}", e)))
}

/// 字符串或数字形式的 ID
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 数字或数字字符串形式的整数
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
