//! Bracket groups and the order id → group reverse index

use crate::types::{BracketRole, OrderId};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// One entry / stop-loss / take-profit triple
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketGroup {
    pub entry_id: Option<OrderId>,
    pub sl_id: Option<OrderId>,
    pub tp_id: Option<OrderId>,
    /// True while the group still enforces OCO semantics
    pub active: bool,
    /// Cumulative absolute filled quantity on the entry leg
    pub entry_filled: Decimal,
}

/// Where a group is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketStage {
    /// Nothing filled yet
    PendingEntry,
    /// Entry partially filled and still working
    EntryFilling,
    /// Entry done, exits resting
    Protected,
    /// OCO resolved or abandoned
    Resolved,
}

impl fmt::Display for BracketStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BracketStage::PendingEntry => write!(f, "PENDING_ENTRY"),
            BracketStage::EntryFilling => write!(f, "ENTRY_FILLING"),
            BracketStage::Protected => write!(f, "PROTECTED"),
            BracketStage::Resolved => write!(f, "RESOLVED"),
        }
    }
}

impl BracketGroup {
    pub fn new(entry_id: Option<OrderId>, sl_id: Option<OrderId>, tp_id: Option<OrderId>) -> Self {
        Self {
            entry_id,
            sl_id,
            tp_id,
            active: true,
            entry_filled: Decimal::ZERO,
        }
    }

    /// Order id for a role, if that leg exists
    pub fn leg(&self, role: BracketRole) -> Option<OrderId> {
        match role {
            BracketRole::Entry => self.entry_id,
            BracketRole::StopLoss => self.sl_id,
            BracketRole::TakeProfit => self.tp_id,
        }
    }

    /// Every (role, id) pair with an id set
    pub fn legs(&self) -> impl Iterator<Item = (BracketRole, OrderId)> + '_ {
        [BracketRole::Entry, BracketRole::StopLoss, BracketRole::TakeProfit]
            .into_iter()
            .filter_map(move |role| self.leg(role).map(|id| (role, id)))
    }

    pub fn stage(&self) -> BracketStage {
        if !self.active {
            BracketStage::Resolved
        } else if self.entry_filled.is_zero() {
            BracketStage::PendingEntry
        } else if self.entry_id.is_some() {
            BracketStage::EntryFilling
        } else {
            BracketStage::Protected
        }
    }
}

/// In-memory record of all tracked groups plus the child index
#[derive(Debug, Default)]
pub struct GroupStore {
    groups: HashMap<String, BracketGroup>,
    index: HashMap<OrderId, (String, BracketRole)>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from loaded groups, rebuilding the index wholesale
    pub fn from_groups(groups: HashMap<String, BracketGroup>) -> Self {
        let mut store = Self {
            groups,
            index: HashMap::new(),
        };
        store.rebuild_index();
        store
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (gid, group) in &self.groups {
            for (role, id) in group.legs() {
                self.index.insert(id, (gid.clone(), role));
            }
        }
    }

    /// Insert a fresh active group, replacing any group with the same id.
    /// Returns the replaced group.
    pub fn register(
        &mut self,
        gid: &str,
        entry_id: Option<OrderId>,
        sl_id: Option<OrderId>,
        tp_id: Option<OrderId>,
    ) -> Option<BracketGroup> {
        let previous = self.groups.remove(gid);
        if let Some(old) = &previous {
            for (_, id) in old.legs() {
                if matches!(self.index.get(&id), Some((owner, _)) if owner == gid) {
                    self.index.remove(&id);
                }
            }
        }

        let group = BracketGroup::new(entry_id, sl_id, tp_id);
        for (role, id) in group.legs() {
            self.index.insert(id, (gid.to_string(), role));
        }
        self.groups.insert(gid.to_string(), group);
        previous
    }

    /// Find the group and role an order belongs to
    pub fn lookup(&self, order_id: OrderId) -> Option<(String, BracketRole)> {
        self.index.get(&order_id).cloned()
    }

    pub fn get(&self, gid: &str) -> Option<&BracketGroup> {
        self.groups.get(gid)
    }

    pub fn get_mut(&mut self, gid: &str) -> Option<&mut BracketGroup> {
        self.groups.get_mut(gid)
    }

    pub fn groups(&self) -> &HashMap<String, BracketGroup> {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Forget resolved groups and their index entries, returning how many were dropped
    pub fn prune_inactive(&mut self) -> usize {
        let resolved: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, group)| !group.active)
            .map(|(gid, _)| gid.clone())
            .collect();

        for gid in &resolved {
            if let Some(group) = self.groups.remove(gid) {
                for (_, id) in group.legs() {
                    if matches!(self.index.get(&id), Some((owner, _)) if owner == gid) {
                        self.index.remove(&id);
                    }
                }
            }
        }
        resolved.len()
    }

    /// Drop everything, returning how many groups were cleared
    pub fn clear(&mut self) -> usize {
        let count = self.groups.len();
        self.groups.clear();
        self.index.clear();
        count
    }
}
