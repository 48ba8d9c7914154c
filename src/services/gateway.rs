//! Order gateway port
//!
//! The bracket manager never talks to Bitfinex directly; it goes through
//! `OrderGateway` so the live REST client and the paper gateway are
//! interchangeable.

use super::bfx_errors::GatewayError;
use crate::types::{Order, OrderId, OrderRequest};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit a new order, returning the exchange's view of it
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, GatewayError>;

    /// Cancel an order by id
    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError>;

    /// Look up a live order. `Ok(None)` means the order is no longer active.
    async fn get_order_by_id(&self, order_id: OrderId) -> Result<Option<Order>, GatewayError>;

    /// Change the signed amount of a live order
    async fn update_order(&self, order_id: OrderId, amount: Option<Decimal>) -> Result<(), GatewayError>;
}

#[async_trait]
impl<G: OrderGateway + ?Sized> OrderGateway for Arc<G> {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        (**self).place_order(request).await
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
        (**self).cancel_order(order_id).await
    }

    async fn get_order_by_id(&self, order_id: OrderId) -> Result<Option<Order>, GatewayError> {
        (**self).get_order_by_id(order_id).await
    }

    async fn update_order(&self, order_id: OrderId, amount: Option<Decimal>) -> Result<(), GatewayError> {
        (**self).update_order(order_id, amount).await
    }
}

/// In-memory gateway for paper trading. Orders rest until cancelled.
#[derive(Debug, Clone)]
pub struct PaperGateway {
    orders: Arc<Mutex<HashMap<OrderId, Order>>>,
    next_id: Arc<AtomicI64>,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            orders: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Number of resting paper orders
    pub async fn open_orders(&self) -> usize {
        self.orders.lock().await.len()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        if request.amount.is_zero() {
            return Err(GatewayError::Rejected("amount must not be zero".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order = Order {
            id,
            symbol: request.symbol.clone(),
            amount: request.amount,
            amount_orig: request.amount,
            order_type: request.kind.wire_name(true).to_string(),
            status: "ACTIVE".to_string(),
            price: request.price,
        };

        info!(
            "[Paper] Placed {} {} {} @ {:?} -> id={}",
            order.order_type, request.symbol, request.amount, request.price, id
        );
        self.orders.lock().await.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
        match self.orders.lock().await.remove(&order_id) {
            Some(_) => {
                info!("[Paper] Cancelled order {}", order_id);
                Ok(())
            }
            None => Err(GatewayError::OrderNotFound(order_id)),
        }
    }

    async fn get_order_by_id(&self, order_id: OrderId) -> Result<Option<Order>, GatewayError> {
        Ok(self.orders.lock().await.get(&order_id).cloned())
    }

    async fn update_order(&self, order_id: OrderId, amount: Option<Decimal>) -> Result<(), GatewayError> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(GatewayError::OrderNotFound(order_id))?;

        if let Some(amount) = amount {
            info!("[Paper] Order {} amount {} -> {}", order_id, order.amount, amount);
            order.amount = amount;
        }
        Ok(())
    }
}
