//! Bitfinex REST client - authenticated v2 order endpoints
//!
//! Every authenticated request carries three headers:
//! - `bfx-nonce`: strictly increasing integer
//! - `bfx-apikey`: the API key
//! - `bfx-signature`: hex HMAC-SHA384 of `/api/{path}{nonce}{body}` keyed by the secret
//!
//! Write endpoints answer with a notification array:
//! `[MTS, TYPE, MESSAGE_ID, null, DATA, CODE, STATUS, TEXT]`

use super::bfx_errors::GatewayError;
use super::gateway::OrderGateway;
use super::retry::{RateLimitGate, ReadRetry, RATE_LIMIT_WINDOW};
use crate::types::{Order, OrderId, OrderRequest, FLAG_REDUCE_ONLY};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha384;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha384 = Hmac<Sha384>;

pub const DEFAULT_REST_URL: &str = "https://api.bitfinex.com";

const PATH_SUBMIT: &str = "v2/auth/w/order/submit";
const PATH_CANCEL: &str = "v2/auth/w/order/cancel";
const PATH_UPDATE: &str = "v2/auth/w/order/update";
const PATH_ORDERS: &str = "v2/auth/r/orders";

/// Hex HMAC-SHA384 of `payload`, as used by both REST and WebSocket auth
pub fn sign_payload(secret: &str, payload: &str) -> Result<String, GatewayError> {
    let mut mac = HmacSha384::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::AuthenticationFailed(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Authenticated Bitfinex REST client
pub struct BitfinexClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    /// Trade from the exchange wallet (`EXCHANGE *` order types) instead of margin
    exchange_wallet: bool,
    last_nonce: AtomicI64,
    retry: ReadRetry,
    rate_gate: RateLimitGate,
}

impl BitfinexClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        exchange_wallet: bool,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(GatewayError::AuthenticationFailed("missing API credentials".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::from_network_error(&e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            exchange_wallet,
            last_nonce: AtomicI64::new(0),
            retry: ReadRetry::default(),
            rate_gate: RateLimitGate::new(),
        })
    }

    /// Microsecond timestamp, bumped if two requests land in the same tick
    fn next_nonce(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last_nonce
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn auth_post(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        self.rate_gate.check()?;
        let result = self.send_signed(path, body).await;
        self.rate_gate.observe(&result, RATE_LIMIT_WINDOW);
        result
    }

    async fn send_signed(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        let body = body.to_string();
        let nonce = self.next_nonce().to_string();
        let signature = sign_payload(&self.api_secret, &format!("/api/{}{}{}", path, nonce, body))?;

        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("bfx-nonce", &nonce)
            .header("bfx-apikey", &self.api_key)
            .header("bfx-signature", &signature)
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        if !status.is_success() {
            return Err(GatewayError::from_response(status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Unwrap a write notification, returning its DATA element
    fn notification_data(notification: Value) -> Result<Value, GatewayError> {
        let fields = notification
            .as_array()
            .ok_or_else(|| GatewayError::Decode("notification is not an array".to_string()))?;

        let status = fields.get(6).and_then(|v| v.as_str()).unwrap_or_default();
        if status == "ERROR" || status == "FAILURE" {
            let text = fields.get(7).and_then(|v| v.as_str()).unwrap_or_default();
            return Err(GatewayError::Rejected(text.to_string()));
        }

        Ok(fields.get(4).cloned().unwrap_or(Value::Null))
    }

    fn order_body(&self, request: &OrderRequest) -> Value {
        let mut body = json!({
            "type": request.kind.wire_name(self.exchange_wallet),
            "symbol": request.symbol,
            "amount": request.amount.to_string(),
        });

        if let Some(price) = request.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(gid) = request.gid {
            body["gid"] = json!(gid);
        }
        if request.reduce_only && !self.exchange_wallet {
            body["flags"] = json!(FLAG_REDUCE_ONLY);
        }
        body
    }

    async fn fetch_order(&self, order_id: OrderId) -> Result<Option<Order>, GatewayError> {
        let rows = self.auth_post(PATH_ORDERS, &json!({ "id": [order_id] })).await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| GatewayError::Decode("orders response is not an array".to_string()))?;

        Ok(rows
            .iter()
            .filter_map(Order::from_array)
            .find(|order| order.id == order_id))
    }
}

#[async_trait]
impl OrderGateway for BitfinexClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        let body = self.order_body(request);
        debug!("[Bitfinex] Submitting order: {}", body);

        let data = Self::notification_data(self.auth_post(PATH_SUBMIT, &body).await?)?;

        // Submit wraps the created orders in a list
        let order = data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Order::from_array)
            .ok_or_else(|| GatewayError::Decode("submit response carried no order".to_string()))?;

        info!(
            "[Bitfinex] Order placed: id={} {} {} {}",
            order.id, order.order_type, order.symbol, order.amount
        );
        Ok(order)
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
        let notification = self.auth_post(PATH_CANCEL, &json!({ "id": order_id })).await?;
        Self::notification_data(notification)?;
        info!("[Bitfinex] Cancel requested for order {}", order_id);
        Ok(())
    }

    async fn get_order_by_id(&self, order_id: OrderId) -> Result<Option<Order>, GatewayError> {
        self.retry.fetch_order(order_id, || self.fetch_order(order_id)).await
    }

    async fn update_order(&self, order_id: OrderId, amount: Option<Decimal>) -> Result<(), GatewayError> {
        let mut body = json!({ "id": order_id });
        if let Some(amount) = amount {
            body["amount"] = json!(amount.to_string());
        }

        match Self::notification_data(self.auth_post(PATH_UPDATE, &body).await?) {
            Ok(_) => {
                info!("[Bitfinex] Order {} updated: amount={:?}", order_id, amount);
                Ok(())
            }
            Err(e) => {
                warn!("[Bitfinex] Update of order {} rejected: {}", order_id, e);
                Err(e)
            }
        }
    }
}
