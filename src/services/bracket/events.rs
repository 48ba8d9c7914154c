//! Private stream events
//!
//! Bitfinex delivers account events on channel 0 as positional arrays:
//! `[0, CODE, PAYLOAD]`. They are decoded here once so the reconciler only
//! ever sees validated data.

use crate::types::{decimal_at, OrderId};
use rust_decimal::Decimal;
use serde_json::Value;

/// Event codes the bracket manager understands
pub const TRACKED_CODES: [&str; 6] = ["te", "tu", "oc", "on", "ou", "os"];

/// A decoded private event
#[derive(Debug, Clone, PartialEq)]
pub enum PrivateEvent {
    /// `te` / `tu`: `[ID, SYMBOL, MTS, ORDER_ID, EXEC_AMOUNT, EXEC_PRICE, ...]`
    TradeExecuted {
        trade_id: Option<i64>,
        order_id: OrderId,
        exec_amount: Decimal,
        exec_price: Option<Decimal>,
    },
    /// `oc`: order array, `STATUS` at index 13 (e.g. `CANCELED`, `EXECUTED @ 100.0(0.5)`)
    OrderClosed { order_id: OrderId, status: String },
    /// `on`
    OrderNew { order_id: OrderId },
    /// `ou`
    OrderUpdated { order_id: OrderId },
    /// `os`: snapshot of active orders on connect
    OrderSnapshot { order_ids: Vec<OrderId> },
}

impl PrivateEvent {
    /// Decode `(code, message)` where `message[2]` holds the payload.
    /// Unknown codes and malformed payloads yield `None`.
    pub fn decode(code: &str, message: &Value) -> Option<Self> {
        let payload = message.as_array()?.get(2)?;
        Self::decode_payload(code, payload)
    }

    pub fn decode_payload(code: &str, payload: &Value) -> Option<Self> {
        let fields = payload.as_array()?;

        match code {
            "te" | "tu" => {
                let order_id = fields.get(3)?.as_i64()?;
                let exec_amount = decimal_at(fields, 4)?;
                Some(PrivateEvent::TradeExecuted {
                    trade_id: fields.first().and_then(|v| v.as_i64()),
                    order_id,
                    exec_amount,
                    exec_price: decimal_at(fields, 5),
                })
            }
            "oc" => Some(PrivateEvent::OrderClosed {
                order_id: fields.first()?.as_i64()?,
                status: fields
                    .get(13)
                    .and_then(|v| v.as_str())
                    .unwrap_or("CANCELED")
                    .to_string(),
            }),
            "on" => Some(PrivateEvent::OrderNew {
                order_id: fields.first()?.as_i64()?,
            }),
            "ou" => Some(PrivateEvent::OrderUpdated {
                order_id: fields.first()?.as_i64()?,
            }),
            "os" => Some(PrivateEvent::OrderSnapshot {
                order_ids: fields
                    .iter()
                    .filter_map(|row| row.as_array()?.first()?.as_i64())
                    .collect(),
            }),
            _ => None,
        }
    }
}

/// Bitfinex reports fully filled orders through `oc` as well
pub fn is_executed_status(status: &str) -> bool {
    status.trim_start().starts_with("EXECUTED")
}
