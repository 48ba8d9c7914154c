//! Core types for the Bitfinex bracket bot

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bitfinex order id
pub type OrderId = i64;

/// Role of an order inside a bracket group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketRole {
    Entry,
    StopLoss,
    TakeProfit,
}

impl BracketRole {
    /// The other protective leg. Entry has no sibling.
    pub fn sibling(&self) -> Option<BracketRole> {
        match self {
            BracketRole::Entry => None,
            BracketRole::StopLoss => Some(BracketRole::TakeProfit),
            BracketRole::TakeProfit => Some(BracketRole::StopLoss),
        }
    }
}

impl fmt::Display for BracketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BracketRole::Entry => write!(f, "entry"),
            BracketRole::StopLoss => write!(f, "stop_loss"),
            BracketRole::TakeProfit => write!(f, "take_profit"),
        }
    }
}

/// Live view of an order as reported by the exchange.
///
/// `amount` is the remaining signed amount: positive for buys, negative for sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub amount: Decimal,
    pub amount_orig: Decimal,
    pub order_type: String,
    pub status: String,
    pub price: Option<Decimal>,
}

impl Order {
    /// Decode a v2 order array:
    /// `[ID, GID, CID, SYMBOL, MTS_CREATE, MTS_UPDATE, AMOUNT, AMOUNT_ORIG, TYPE, TYPE_PREV,
    ///   MTS_TIF, _, FLAGS, STATUS, _, _, PRICE, ...]`
    pub fn from_array(row: &serde_json::Value) -> Option<Self> {
        let fields = row.as_array()?;
        let id = fields.first()?.as_i64()?;
        let symbol = fields.get(3).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let amount = decimal_at(fields, 6)?;
        let amount_orig = decimal_at(fields, 7).unwrap_or(amount);
        let order_type = fields.get(8).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let status = fields.get(13).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let price = decimal_at(fields, 16);

        Some(Self {
            id,
            symbol,
            amount,
            amount_orig,
            order_type,
            status,
            price,
        })
    }
}

/// Read a numeric field out of a positional array as a Decimal
pub fn decimal_at(fields: &[serde_json::Value], index: usize) -> Option<Decimal> {
    fields
        .get(index)
        .and_then(|v| v.as_f64())
        .and_then(|f| Decimal::try_from(f).ok())
}

/// Kind of order to submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl OrderKind {
    /// Bitfinex order type string. Exchange wallet orders carry the `EXCHANGE` prefix.
    pub fn wire_name(&self, exchange_wallet: bool) -> &'static str {
        match (self, exchange_wallet) {
            (OrderKind::Market, true) => "EXCHANGE MARKET",
            (OrderKind::Limit, true) => "EXCHANGE LIMIT",
            (OrderKind::Stop, true) => "EXCHANGE STOP",
            (OrderKind::Market, false) => "MARKET",
            (OrderKind::Limit, false) => "LIMIT",
            (OrderKind::Stop, false) => "STOP",
        }
    }
}

/// Reduce-only order flag
pub const FLAG_REDUCE_ONLY: u32 = 1024;

/// A new order to place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub kind: OrderKind,
    /// Signed amount: positive buys, negative sells
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub gid: Option<i64>,
    pub reduce_only: bool,
}

/// Parameters for opening a full bracket (entry plus optional exits)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketRequest {
    pub group_id: String,
    pub symbol: String,
    /// Signed entry amount
    pub amount: Decimal,
    /// Entry limit price; `None` enters at market
    pub entry_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
}

impl BracketRequest {
    pub fn entry_order(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            kind: if self.entry_price.is_some() { OrderKind::Limit } else { OrderKind::Market },
            amount: self.amount,
            price: self.entry_price,
            gid: self.group_id.parse().ok(),
            reduce_only: false,
        }
    }

    /// Exit order for a protective role; exits trade the opposite direction.
    pub fn exit_order(&self, role: BracketRole) -> Option<OrderRequest> {
        let (kind, price) = match role {
            BracketRole::Entry => return None,
            BracketRole::StopLoss => (OrderKind::Stop, self.stop_loss_price?),
            BracketRole::TakeProfit => (OrderKind::Limit, self.take_profit_price?),
        };

        Some(OrderRequest {
            symbol: self.symbol.clone(),
            kind,
            amount: -self.amount,
            price: Some(price),
            gid: self.group_id.parse().ok(),
            reduce_only: true,
        })
    }
}
