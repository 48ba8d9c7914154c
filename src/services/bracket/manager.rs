//! Bracket Manager - OCO enforcement for entry / stop-loss / take-profit triples
//!
//! Reacts to private stream events:
//! - Entry fills grow `entry_filled` and resize both exits to match
//! - An exit fill cancels its sibling and resolves the group
//! - An entry cancel before any fill tears the exits down; after a fill the
//!   exits keep protecting the position
//! - A protective cancel resolves the group without touching the sibling
//!
//! Every mutation is persisted. Gateway failures are logged per leg and never
//! abort the rest of the event.

use super::events::{is_executed_status, PrivateEvent};
use super::group::{BracketGroup, GroupStore};
use super::state_file::StateFile;
use crate::config::BracketConfig;
use crate::services::bfx_errors::GatewayError;
use crate::services::gateway::OrderGateway;
use crate::services::metrics::Metrics;
use crate::types::{BracketRequest, BracketRole, OrderId};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

/// How many recent trade ids are remembered to drop `tu` repeats of a `te`
const SEEN_TRADES_CAPACITY: usize = 1024;

pub struct BracketManager<G: OrderGateway> {
    store: GroupStore,
    state_file: StateFile,
    gateway: G,
    partial_adjust: bool,
    metrics: Metrics,
    seen_trades: HashSet<i64>,
    seen_order: VecDeque<i64>,
}

impl<G: OrderGateway> BracketManager<G> {
    /// Build a manager and restore any active groups from disk
    pub fn new(gateway: G, config: &BracketConfig, metrics: Metrics) -> Self {
        let state_file = StateFile::new(&config.state_file);
        let store = GroupStore::from_groups(state_file.load());

        if !store.is_empty() {
            info!("[Bracket] Recovered {} active groups", store.len());
        }

        Self {
            store,
            state_file,
            gateway,
            partial_adjust: config.partial_adjust,
            metrics,
            seen_trades: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn group(&self, gid: &str) -> Option<&BracketGroup> {
        self.store.get(gid)
    }

    pub fn store(&self) -> &GroupStore {
        &self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    fn persist(&self) {
        if !self.state_file.save(self.store.groups()) {
            self.metrics.inc_persist_failures();
        }
    }

    /// Start tracking a group. Replaces any group with the same id.
    pub fn register_group(
        &mut self,
        gid: &str,
        entry_id: Option<OrderId>,
        sl_id: Option<OrderId>,
        tp_id: Option<OrderId>,
    ) {
        // Resolved groups stay visible until the next registration, then go
        let pruned = self.store.prune_inactive();
        if pruned > 0 {
            debug!("[Bracket] Dropped {} resolved groups", pruned);
        }
        if self.store.register(gid, entry_id, sl_id, tp_id).is_some() {
            warn!("[Bracket] Group {} re-registered, previous state discarded", gid);
        }
        info!(
            "[Bracket] Registered group {}: entry={:?} sl={:?} tp={:?}",
            gid, entry_id, sl_id, tp_id
        );
        self.persist();
    }

    /// Clear every group; optionally delete the state file. Returns the cleared count.
    pub fn reset(&mut self, delete_file: bool) -> usize {
        let count = self.store.clear();
        self.seen_trades.clear();
        self.seen_order.clear();
        if delete_file {
            self.state_file.remove();
        }
        info!("[Bracket] Reset cleared {} groups", count);
        count
    }

    /// Place entry and exit orders, then track them as one group.
    ///
    /// Fails only if the entry cannot be placed; a rejected exit is logged and
    /// left out of the group.
    pub async fn open_bracket(&mut self, request: &BracketRequest) -> Result<BracketGroup, GatewayError> {
        let entry = self.gateway.place_order(&request.entry_order()).await?;

        let mut exits = [None, None];
        for (slot, role) in [BracketRole::StopLoss, BracketRole::TakeProfit].into_iter().enumerate() {
            let Some(order) = request.exit_order(role) else {
                continue;
            };
            match self.gateway.place_order(&order).await {
                Ok(placed) => exits[slot] = Some(placed.id),
                Err(e) => {
                    self.metrics.inc_gateway_errors();
                    warn!(
                        "[Bracket] Failed to place {} for group {}: {}",
                        role, request.group_id, e
                    );
                }
            }
        }

        self.register_group(&request.group_id, Some(entry.id), exits[0], exits[1]);
        self.store
            .get(&request.group_id)
            .cloned()
            .ok_or_else(|| GatewayError::Decode("group vanished after registration".to_string()))
    }

    /// Entry point for raw stream messages: `message[2]` holds the payload
    pub async fn handle_private_event(&mut self, code: &str, message: &Value) {
        match PrivateEvent::decode(code, message) {
            Some(event) => self.apply_event(event).await,
            None => {
                self.metrics.inc_events_malformed();
                debug!("[Bracket] Skipping undecodable {} event", code);
            }
        }
    }

    /// Apply one decoded event to the store
    pub async fn apply_event(&mut self, event: PrivateEvent) {
        self.metrics.inc_events_processed();

        match event {
            PrivateEvent::TradeExecuted {
                trade_id,
                order_id,
                exec_amount,
                ..
            } => {
                if let Some(trade_id) = trade_id {
                    if !self.remember_trade(trade_id) {
                        debug!("[Bracket] Trade {} already applied", trade_id);
                        return;
                    }
                }
                self.on_trade(order_id, exec_amount).await;
            }
            PrivateEvent::OrderClosed { order_id, status } => {
                self.on_order_closed(order_id, &status).await;
            }
            PrivateEvent::OrderNew { order_id } | PrivateEvent::OrderUpdated { order_id } => {
                if let Some((gid, role)) = self.store.lookup(order_id) {
                    debug!("[Bracket] Order {} ({} of {}) acknowledged", order_id, role, gid);
                }
            }
            PrivateEvent::OrderSnapshot { order_ids } => {
                let tracked = order_ids
                    .iter()
                    .filter(|id| self.store.lookup(**id).is_some())
                    .count();
                debug!(
                    "[Bracket] Order snapshot: {} active, {} tracked",
                    order_ids.len(),
                    tracked
                );
            }
        }
    }

    /// Returns false if the trade id was seen recently
    fn remember_trade(&mut self, trade_id: i64) -> bool {
        if !self.seen_trades.insert(trade_id) {
            return false;
        }
        self.seen_order.push_back(trade_id);
        if self.seen_order.len() > SEEN_TRADES_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_trades.remove(&oldest);
            }
        }
        true
    }

    /// Resolve an order to an active group, skipping anything untracked
    fn active_group_for(&self, order_id: OrderId) -> Option<(String, BracketRole)> {
        let (gid, role) = self.store.lookup(order_id)?;
        match self.store.get(&gid) {
            Some(group) if group.active => Some((gid, role)),
            Some(_) => {
                debug!("[Bracket] Ignoring event for order {} of resolved group {}", order_id, gid);
                None
            }
            None => None,
        }
    }

    async fn on_trade(&mut self, order_id: OrderId, exec_amount: Decimal) {
        let Some((gid, role)) = self.active_group_for(order_id) else {
            return;
        };

        match role {
            BracketRole::Entry => self.on_entry_fill(&gid, exec_amount).await,
            BracketRole::StopLoss | BracketRole::TakeProfit => {
                self.on_exit_fill(&gid, role, exec_amount).await
            }
        }
    }

    async fn on_entry_fill(&mut self, gid: &str, exec_amount: Decimal) {
        self.metrics.inc_entry_fills();

        let Some(group) = self.store.get_mut(gid) else {
            return;
        };
        let Some(filled) = group.entry_filled.checked_add(exec_amount.abs()) else {
            warn!(
                "[Bracket] Entry fill {} on {} overflows filled amount {}, skipping",
                exec_amount, gid, group.entry_filled
            );
            self.metrics.inc_events_malformed();
            return;
        };
        group.entry_filled = filled;
        info!("[Bracket] Entry fill on {}: +{} (total {})", gid, exec_amount.abs(), filled);
        self.persist();

        // Exits close the position, so they trade against the entry direction
        let exit_sign_negative = exec_amount > Decimal::ZERO;
        self.sync_protective_legs(gid, filled, exit_sign_negative).await;
    }

    /// Resize both exits to the filled entry quantity
    async fn sync_protective_legs(&mut self, gid: &str, filled: Decimal, exit_sign_negative: bool) {
        for role in [BracketRole::StopLoss, BracketRole::TakeProfit] {
            let leg_id = match self.store.get(gid) {
                Some(group) if group.active => group.leg(role),
                _ => return,
            };
            let Some(leg_id) = leg_id else {
                continue;
            };

            let live = match self.gateway.get_order_by_id(leg_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    debug!("[Bracket] {} {} of {} not live, skipping resize", role, leg_id, gid);
                    continue;
                }
                Err(e) => {
                    self.metrics.inc_gateway_errors();
                    warn!("[Bracket] Failed to fetch {} {} of {}: {}", role, leg_id, gid, e);
                    continue;
                }
            };

            if live.amount.abs() == filled {
                continue;
            }

            let negative = if live.amount.is_zero() {
                exit_sign_negative
            } else {
                live.amount < Decimal::ZERO
            };
            let desired = if negative { -filled } else { filled };

            match self.gateway.update_order(leg_id, Some(desired)).await {
                Ok(()) => {
                    self.metrics.inc_legs_resized();
                    info!("[Bracket] Resized {} {} of {}: {} -> {}", role, leg_id, gid, live.amount, desired);
                }
                Err(e) => {
                    self.metrics.inc_gateway_errors();
                    warn!("[Bracket] Failed to resize {} {} of {}: {}", role, leg_id, gid, e);
                }
            }
        }
    }

    async fn on_exit_fill(&mut self, gid: &str, role: BracketRole, exec_amount: Decimal) {
        self.metrics.inc_exit_fills();
        info!("[Bracket] {} fill on {}: {}", role, gid, exec_amount);

        let sibling = role
            .sibling()
            .and_then(|sibling_role| self.store.get(gid).and_then(|g| g.leg(sibling_role)));

        if let Some(sibling_id) = sibling {
            if self.partial_adjust {
                self.adjust_sibling_on_partial(gid, sibling_id, exec_amount.abs()).await;
            }
            // OCO: always cancel, even if the partial adjust already did
            self.cancel_leg(gid, sibling_id).await;
        }

        self.deactivate(gid);
    }

    /// Shrink the sibling exit by the filled quantity; cancel it if nothing is left
    async fn adjust_sibling_on_partial(&mut self, gid: &str, sibling_id: OrderId, filled: Decimal) {
        let live = match self.gateway.get_order_by_id(sibling_id).await {
            Ok(Some(order)) => order,
            Ok(None) => return,
            Err(e) => {
                self.metrics.inc_gateway_errors();
                warn!("[Bracket] Failed to fetch sibling {} of {}: {}", sibling_id, gid, e);
                return;
            }
        };

        let remaining = (live.amount.abs() - filled).max(Decimal::ZERO);
        if remaining <= Decimal::ZERO {
            self.cancel_leg(gid, sibling_id).await;
            self.deactivate(gid);
            return;
        }

        let desired = if live.amount < Decimal::ZERO { -remaining } else { remaining };
        match self.gateway.update_order(sibling_id, Some(desired)).await {
            Ok(()) => {
                self.metrics.inc_legs_resized();
                info!("[Bracket] Shrunk sibling {} of {}: {} -> {}", sibling_id, gid, live.amount, desired);
            }
            Err(e) => {
                self.metrics.inc_gateway_errors();
                warn!("[Bracket] Failed to shrink sibling {} of {}: {}", sibling_id, gid, e);
            }
        }
    }

    async fn on_order_closed(&mut self, order_id: OrderId, status: &str) {
        let Some((gid, role)) = self.active_group_for(order_id) else {
            return;
        };
        let executed = is_executed_status(status);

        match role {
            BracketRole::Entry => {
                let filled = self
                    .store
                    .get(&gid)
                    .map(|g| g.entry_filled)
                    .unwrap_or_default();

                if executed || filled > Decimal::ZERO {
                    if let Some(group) = self.store.get_mut(&gid) {
                        group.entry_id = None;
                    }
                    info!(
                        "[Bracket] Entry {} of {} closed ({}) with {} filled, exits stay live",
                        order_id, gid, status, filled
                    );
                    self.persist();
                } else {
                    info!("[Bracket] Entry {} of {} cancelled before any fill", order_id, gid);
                    let legs: Vec<OrderId> = self
                        .store
                        .get(&gid)
                        .map(|g| g.sl_id.into_iter().chain(g.tp_id).collect())
                        .unwrap_or_default();
                    for leg_id in legs {
                        self.cancel_leg(&gid, leg_id).await;
                    }
                    self.deactivate(&gid);
                }
            }
            BracketRole::StopLoss | BracketRole::TakeProfit => {
                if executed {
                    // Filled exit reported through oc before (or without) its trade
                    let sibling = role
                        .sibling()
                        .and_then(|r| self.store.get(&gid).and_then(|g| g.leg(r)));
                    if let Some(sibling_id) = sibling {
                        self.cancel_leg(&gid, sibling_id).await;
                    }
                } else {
                    info!("[Bracket] {} {} of {} cancelled, resolving group", role, order_id, gid);
                }
                self.deactivate(&gid);
            }
        }
    }

    /// Best-effort cancel; failures (including "already cancelled") are logged only
    async fn cancel_leg(&mut self, gid: &str, order_id: OrderId) {
        match self.gateway.cancel_order(order_id).await {
            Ok(()) => {
                self.metrics.inc_cancels_issued();
                info!("[Bracket] Cancelled order {} of {}", order_id, gid);
            }
            Err(e) => {
                self.metrics.inc_gateway_errors();
                warn!("[Bracket] Cancel of order {} ({}) failed: {}", order_id, gid, e);
            }
        }
    }

    fn deactivate(&mut self, gid: &str) {
        if let Some(group) = self.store.get_mut(gid) {
            if group.active {
                group.active = false;
                self.metrics.inc_groups_resolved();
                info!("[Bracket] Group {} resolved", gid);
            }
        }
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::PaperGateway;
    use crate::types::{Order, OrderRequest};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Gateway fake that records every call
    #[derive(Default)]
    struct RecordingGateway {
        orders: Mutex<HashMap<OrderId, Order>>,
        cancels: Mutex<Vec<OrderId>>,
        updates: Mutex<Vec<(OrderId, Option<Decimal>)>>,
        fail_lookups: bool,
    }

    impl RecordingGateway {
        fn with_orders(orders: &[(OrderId, Decimal)]) -> Self {
            let gateway = Self::default();
            for (id, amount) in orders {
                gateway.orders.lock().unwrap().insert(*id, order(*id, *amount));
            }
            gateway
        }

        fn cancels(&self) -> Vec<OrderId> {
            self.cancels.lock().unwrap().clone()
        }

        fn updates(&self) -> Vec<(OrderId, Option<Decimal>)> {
            self.updates.lock().unwrap().clone()
        }
    }

    fn order(id: OrderId, amount: Decimal) -> Order {
        Order {
            id,
            symbol: "tBTCUSD".to_string(),
            amount,
            amount_orig: amount,
            order_type: "EXCHANGE LIMIT".to_string(),
            status: "ACTIVE".to_string(),
            price: None,
        }
    }

    #[async_trait]
    impl OrderGateway for RecordingGateway {
        async fn place_order(&self, _request: &OrderRequest) -> Result<Order, GatewayError> {
            Err(GatewayError::Rejected("not supported".to_string()))
        }

        async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
            self.cancels.lock().unwrap().push(order_id);
            match self.orders.lock().unwrap().remove(&order_id) {
                Some(_) => Ok(()),
                None => Err(GatewayError::OrderNotFound(order_id)),
            }
        }

        async fn get_order_by_id(&self, order_id: OrderId) -> Result<Option<Order>, GatewayError> {
            if self.fail_lookups {
                return Err(GatewayError::Network("connection reset".to_string()));
            }
            Ok(self.orders.lock().unwrap().get(&order_id).cloned())
        }

        async fn update_order(&self, order_id: OrderId, amount: Option<Decimal>) -> Result<(), GatewayError> {
            self.updates.lock().unwrap().push((order_id, amount));
            let mut orders = self.orders.lock().unwrap();
            let live = orders
                .get_mut(&order_id)
                .ok_or(GatewayError::OrderNotFound(order_id))?;
            if let Some(amount) = amount {
                live.amount = amount;
            }
            Ok(())
        }
    }

    fn config(dir: &TempDir, partial_adjust: bool) -> BracketConfig {
        BracketConfig {
            partial_adjust,
            state_file: dir.path().join("config").join("bracket_state.json"),
        }
    }

    fn manager(dir: &TempDir, gateway: RecordingGateway, partial_adjust: bool) -> BracketManager<RecordingGateway> {
        let mut manager = BracketManager::new(gateway, &config(dir, partial_adjust), Metrics::new());
        manager.register_group("g1", Some(100), Some(101), Some(102));
        manager
    }

    fn trade(trade_id: i64, order_id: OrderId, exec_amount: Decimal) -> PrivateEvent {
        PrivateEvent::TradeExecuted {
            trade_id: Some(trade_id),
            order_id,
            exec_amount,
            exec_price: Some(dec!(30000)),
        }
    }

    fn closed(order_id: OrderId, status: &str) -> PrivateEvent {
        PrivateEvent::OrderClosed {
            order_id,
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn test_entry_fill_then_stop_loss_fill() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, Decimal::ZERO), (102, Decimal::ZERO)]);
        let mut manager = manager(&dir, gateway, false);

        manager
            .handle_private_event("te", &json!([0, "te", [1, "tBTCUSD", 1, 100, 0.5, 30000.0]]))
            .await;
        assert_eq!(manager.group("g1").unwrap().entry_filled, dec!(0.5));
        assert_eq!(
            manager.gateway().updates(),
            vec![(101, Some(dec!(-0.5))), (102, Some(dec!(-0.5)))]
        );

        manager
            .handle_private_event("te", &json!([0, "te", [2, "tBTCUSD", 2, 101, -0.5, 29000.0]]))
            .await;
        assert_eq!(manager.gateway().cancels(), vec![102]);
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_entry_fills_accumulate_absolute_amounts() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-0.1)), (102, dec!(-0.1))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 100, dec!(0.2))).await;
        manager.apply_event(trade(2, 100, dec!(0.3))).await;
        manager.apply_event(trade(3, 100, dec!(0.1))).await;

        let group = manager.group("g1").unwrap();
        assert_eq!(group.entry_filled, dec!(0.6));
        assert!(group.active);

        let live = manager.gateway().orders.lock().unwrap().clone();
        assert_eq!(live[&101].amount, dec!(-0.6));
        assert_eq!(live[&102].amount, dec!(-0.6));
    }

    #[tokio::test]
    async fn test_short_entry_keeps_positive_exit_sign() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(0.1)), (102, Decimal::ZERO)]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 100, dec!(-0.4))).await;

        assert_eq!(
            manager.gateway().updates(),
            vec![(101, Some(dec!(0.4))), (102, Some(dec!(0.4)))]
        );
    }

    #[tokio::test]
    async fn test_exits_already_sized_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-0.5)), (102, dec!(-0.5))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 100, dec!(0.5))).await;

        assert!(manager.gateway().updates().is_empty());
    }

    #[tokio::test]
    async fn test_trade_update_for_same_trade_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-0.5)), (102, dec!(-0.5))]);
        let mut manager = manager(&dir, gateway, false);

        manager
            .handle_private_event("te", &json!([0, "te", [77, "tBTCUSD", 1, 100, 0.5, 30000.0]]))
            .await;
        manager
            .handle_private_event("tu", &json!([0, "tu", [77, "tBTCUSD", 1, 100, 0.5, 30000.0, "EXCHANGE LIMIT"]]))
            .await;

        assert_eq!(manager.group("g1").unwrap().entry_filled, dec!(0.5));
    }

    #[tokio::test]
    async fn test_partial_adjust_shrinks_then_cancels_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, true);

        manager.apply_event(trade(1, 101, dec!(-0.4))).await;

        assert_eq!(manager.gateway().updates(), vec![(102, Some(dec!(-0.6)))]);
        assert_eq!(manager.gateway().cancels(), vec![102]);
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_partial_adjust_exhausted_sibling_cancel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-0.4)), (102, dec!(-0.4))]);
        let mut manager = manager(&dir, gateway, true);

        manager.apply_event(trade(1, 102, dec!(-0.4))).await;

        // Once from the adjust step, once from the unconditional OCO cancel
        assert_eq!(manager.gateway().cancels(), vec![101, 101]);
        assert!(manager.gateway().updates().is_empty());
        assert!(!manager.group("g1").unwrap().active);
        assert_eq!(manager.metrics.snapshot().groups_resolved, 1);
    }

    #[tokio::test]
    async fn test_exit_fill_without_partial_adjust_only_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 102, dec!(-0.3))).await;

        assert!(manager.gateway().updates().is_empty());
        assert_eq!(manager.gateway().cancels(), vec![101]);
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_entry_cancel_before_fill_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(closed(100, "CANCELED")).await;

        assert_eq!(manager.gateway().cancels(), vec![101, 102]);
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_entry_cancel_after_partial_fill_keeps_protection() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-0.3)), (102, dec!(-0.3))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 100, dec!(0.3))).await;
        manager
            .apply_event(closed(100, "CANCELED was: PARTIALLY FILLED @ 30000.0(0.3)"))
            .await;

        let group = manager.group("g1").unwrap();
        assert!(group.active);
        assert_eq!(group.entry_id, None);
        assert_eq!(group.sl_id, Some(101));
        assert!(manager.gateway().cancels().is_empty());
    }

    #[tokio::test]
    async fn test_entry_executed_close_never_cancels_exits() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        // oc can arrive before the trade itself
        manager.apply_event(closed(100, "EXECUTED @ 30000.0(1.0)")).await;
        manager.apply_event(trade(1, 100, dec!(1.0))).await;

        let group = manager.group("g1").unwrap();
        assert!(group.active);
        assert_eq!(group.entry_id, None);
        assert_eq!(group.entry_filled, dec!(1.0));
        assert!(manager.gateway().cancels().is_empty());
    }

    #[tokio::test]
    async fn test_protective_cancel_resolves_without_touching_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(closed(101, "CANCELED")).await;

        assert!(manager.gateway().cancels().is_empty());
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_protective_executed_close_enforces_oco() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(closed(102, "EXECUTED @ 31000.0(-1.0)")).await;

        assert_eq!(manager.gateway().cancels(), vec![101]);
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_lookup_failures_do_not_abort_event() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway {
            fail_lookups: true,
            ..RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))])
        };
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 100, dec!(0.25))).await;

        assert_eq!(manager.group("g1").unwrap().entry_filled, dec!(0.25));
        assert!(manager.gateway().updates().is_empty());
        assert_eq!(manager.metrics.snapshot().gateway_errors, 2);
    }

    #[tokio::test]
    async fn test_resolved_groups_ignore_further_events() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(trade(1, 101, dec!(-1.0))).await;
        manager.apply_event(trade(2, 102, dec!(-1.0))).await;
        manager.apply_event(trade(3, 100, dec!(1.0))).await;

        assert_eq!(manager.gateway().cancels(), vec![102]);
        assert_eq!(manager.group("g1").unwrap().entry_filled, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_untracked_and_malformed_events_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, RecordingGateway::default(), false);

        manager.apply_event(trade(1, 999, dec!(1.0))).await;
        manager.handle_private_event("te", &json!([0, "te", "garbage"])).await;
        manager.handle_private_event("oc", &json!({"event": "info"})).await;

        let snapshot = manager.metrics.snapshot();
        assert_eq!(snapshot.events_processed, 1);
        assert_eq!(snapshot.events_malformed, 2);
        assert!(manager.group("g1").unwrap().active);
        assert!(manager.gateway().cancels().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-0.2)), (102, dec!(-0.2))]);
        let mut first = manager(&dir, gateway, false);
        first.register_group("g2", Some(200), Some(201), Some(202));
        first.apply_event(trade(1, 100, dec!(0.2))).await;
        first.apply_event(closed(200, "CANCELED")).await;
        drop(first);

        let restarted = BracketManager::new(RecordingGateway::default(), &config(&dir, false), Metrics::new());

        assert!(restarted.group("g2").is_none());
        let group = restarted.group("g1").unwrap();
        assert_eq!(group.entry_filled, dec!(0.2));
        assert_eq!(group.tp_id, Some(102));
        assert_eq!(
            restarted.store().lookup(101),
            Some(("g1".to_string(), BracketRole::StopLoss))
        );
    }

    #[tokio::test]
    async fn test_reset_clears_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, RecordingGateway::default(), false);
        manager.register_group("g2", Some(200), None, None);
        let path = config(&dir, false).state_file;
        assert!(path.exists());

        assert_eq!(manager.reset(true), 2);
        assert!(manager.store().is_empty());
        assert_eq!(manager.store().lookup(100), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reset_can_keep_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, RecordingGateway::default(), false);

        assert_eq!(manager.reset(false), 1);
        assert!(config(&dir, false).state_file.exists());
    }

    #[tokio::test]
    async fn test_open_bracket_places_and_tracks_all_legs() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = BracketManager::new(PaperGateway::new(), &config(&dir, false), Metrics::new());

        let request = BracketRequest {
            group_id: "7".to_string(),
            symbol: "tBTCUSD".to_string(),
            amount: dec!(0.5),
            entry_price: Some(dec!(30000)),
            stop_loss_price: Some(dec!(29000)),
            take_profit_price: Some(dec!(32000)),
        };
        let group = manager.open_bracket(&request).await.unwrap();

        let entry_id = group.entry_id.unwrap();
        let sl_id = group.sl_id.unwrap();
        let tp_id = group.tp_id.unwrap();
        assert_eq!(manager.store().lookup(sl_id), Some(("7".to_string(), BracketRole::StopLoss)));
        assert_eq!(manager.gateway().open_orders().await, 3);

        let sl = manager.gateway().get_order_by_id(sl_id).await.unwrap().unwrap();
        assert_eq!(sl.amount, dec!(-0.5));

        manager.apply_event(trade(1, entry_id, dec!(0.5))).await;
        manager.apply_event(trade(2, tp_id, dec!(-0.5))).await;

        assert!(manager.gateway().get_order_by_id(sl_id).await.unwrap().is_none());
        assert!(!manager.group("7").unwrap().active);
    }

    #[tokio::test]
    async fn test_overflowing_entry_fill_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, -Decimal::MAX), (102, -Decimal::MAX)]);
        let mut manager = manager(&dir, gateway, false);

        manager
            .handle_private_event("te", &json!([0, "te", [1, "tBTCUSD", 1, 100, 7.0e28, 30000.0]]))
            .await;
        let after_first = manager.group("g1").unwrap().entry_filled;
        assert!(after_first > Decimal::ZERO);

        manager
            .handle_private_event("te", &json!([0, "te", [2, "tBTCUSD", 2, 100, 7.0e28, 30000.0]]))
            .await;

        let group = manager.group("g1").unwrap();
        assert!(group.active);
        assert_eq!(group.entry_filled, after_first);
        assert_eq!(manager.metrics.snapshot().events_malformed, 1);

        // Still reconciling afterwards
        manager.apply_event(trade(3, 101, dec!(-1))).await;
        assert_eq!(manager.gateway().cancels(), vec![102]);
        assert!(!manager.group("g1").unwrap().active);
    }

    #[tokio::test]
    async fn test_partial_adjust_lookup_failure_still_cancels_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway {
            fail_lookups: true,
            ..RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))])
        };
        let mut manager = manager(&dir, gateway, true);

        manager.apply_event(trade(1, 101, dec!(-0.4))).await;

        assert!(manager.gateway().updates().is_empty());
        assert_eq!(manager.gateway().cancels(), vec![102]);
        assert!(!manager.group("g1").unwrap().active);
        assert_eq!(manager.metrics.snapshot().gateway_errors, 1);
    }

    #[tokio::test]
    async fn test_resolved_groups_pruned_on_next_registration() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::with_orders(&[(101, dec!(-1.0)), (102, dec!(-1.0))]);
        let mut manager = manager(&dir, gateway, false);

        manager.apply_event(closed(101, "CANCELED")).await;
        assert!(!manager.group("g1").unwrap().active);

        manager.register_group("g2", Some(200), Some(201), Some(202));

        assert!(manager.group("g1").is_none());
        assert_eq!(manager.store().lookup(102), None);
        assert_eq!(manager.store().len(), 1);

        let raw: Value = serde_json::from_str(
            &std::fs::read_to_string(config(&dir, false).state_file).unwrap(),
        )
        .unwrap();
        assert!(raw["groups"].get("g1").is_none());
        assert_eq!(raw["groups"]["g2"]["sl_id"], 201);
    }

    #[tokio::test]
    async fn test_open_bracket_entry_rejection_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = BracketManager::new(RecordingGateway::default(), &config(&dir, false), Metrics::new());

        let request = BracketRequest {
            group_id: "8".to_string(),
            symbol: "tBTCUSD".to_string(),
            amount: dec!(1),
            entry_price: None,
            stop_loss_price: None,
            take_profit_price: None,
        };

        assert!(manager.open_bracket(&request).await.is_err());
        assert!(manager.store().is_empty());
    }
}
