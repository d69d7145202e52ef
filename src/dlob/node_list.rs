//! `NodeList`: an ordered multiset of `OrderNode`s of one (classification,
//! side), keyed for O(1) lookup and restartable forward iteration, backed
//! by a `BTreeMap` + `FnvHashMap` pair rather than a linked list so
//! `remove` can't leave stale neighbor pointers behind.

use fnv::FnvHashMap;
use std::collections::BTreeMap;

use crate::dlob::node::{order_key, DLOBNode, NodeType, OrderKey, OrderNode};
use crate::types::{Order, UserAccount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Position of a node within the list's `BTreeMap`: `(signed sort value,
/// insertion sequence)`. Ties on sort value are broken by ascending
/// sequence, i.e. FIFO, independent of `SortDirection`.
type Position = (i128, u64);

struct IndexedNode {
    node: OrderNode,
    position: Position,
}

pub struct NodeList {
    node_type: NodeType,
    sort_direction: SortDirection,
    by_position: BTreeMap<Position, OrderKey>,
    by_key: FnvHashMap<OrderKey, IndexedNode>,
    next_seq: u64,
}

impl NodeList {
    pub fn new(node_type: NodeType, sort_direction: SortDirection) -> Self {
        Self {
            node_type,
            sort_direction,
            by_position: BTreeMap::new(),
            by_key: FnvHashMap::default(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_position.clear();
        self.by_key.clear();
        self.next_seq = 0;
    }

    fn raw_sort_value(&self, order: &Order) -> i128 {
        match self.node_type {
            NodeType::RestingLimit => order.price as i128,
            NodeType::FloatingLimit => order.oracle_price_offset as i128,
            NodeType::TakingLimit | NodeType::Market => order.slot as i128,
            NodeType::Trigger => order.trigger_price as i128,
        }
    }

    fn position_for(&self, order: &Order, seq: u64) -> Position {
        let raw = self.raw_sort_value(order);
        let signed = match self.sort_direction {
            SortDirection::Asc => raw,
            SortDirection::Desc => -raw,
        };
        (signed, seq)
    }

    /// Insert `order`. A duplicate `(order_id, user_account)` is rejected
    /// silently — the post-state is equivalent to a single insert.
    pub fn insert(&mut self, order: Order, user_account: UserAccount) {
        let key = order_key(order.order_id, user_account);
        if self.by_key.contains_key(&key) {
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let position = self.position_for(&order, seq);

        let node = OrderNode::new(self.node_type, order, user_account);
        self.by_position.insert(position, key);
        self.by_key.insert(key, IndexedNode { node, position });
    }

    /// Remove by key. Missing key is a no-op.
    pub fn remove(&mut self, order_id: u32, user_account: UserAccount) {
        let key = order_key(order_id, user_account);
        if let Some(indexed) = self.by_key.remove(&key) {
            self.by_position.remove(&indexed.position);
        }
    }

    /// Replace the stored order in place. The node's sort position does
    /// not change — callers guarantee the fields that feed the sort key
    /// are unchanged.
    pub fn update(&mut self, order: Order, user_account: UserAccount) {
        let key = order_key(order.order_id, user_account);
        if let Some(indexed) = self.by_key.get_mut(&key) {
            indexed.node.order = order;
        }
    }

    pub fn get(&self, order_id: u32, user_account: UserAccount) -> Option<&OrderNode> {
        self.by_key
            .get(&order_key(order_id, user_account))
            .map(|indexed| &indexed.node)
    }

    pub fn contains(&self, order_id: u32, user_account: UserAccount) -> bool {
        self.by_key.contains_key(&order_key(order_id, user_account))
    }

    /// Restartable forward iterator in sort order (price-time or
    /// slot/trigger order per the list's configuration).
    pub fn iter(&self) -> impl Iterator<Item = &OrderNode> + '_ {
        self.by_position
            .values()
            .map(move |key| &self.by_key[key].node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PositionDirection};

    fn user(n: u8) -> UserAccount {
        UserAccount::new([n; 32])
    }

    fn order(id: u32, price: u64) -> Order {
        Order {
            order_id: id,
            price,
            market_type: MarketType::Perp,
            direction: PositionDirection::Short,
            ..Order::default()
        }
    }

    #[test]
    fn ascending_list_sorts_by_price_then_fifo() {
        let mut list = NodeList::new(NodeType::RestingLimit, SortDirection::Asc);
        list.insert(order(1, 100), user(1));
        list.insert(order(2, 90), user(2));
        list.insert(order(3, 90), user(3));

        let ids: Vec<u32> = list.iter().map(|n| n.order.order_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn descending_list_reverses_order() {
        let mut list = NodeList::new(NodeType::RestingLimit, SortDirection::Desc);
        list.insert(order(1, 100), user(1));
        list.insert(order(2, 90), user(2));

        let ids: Vec<u32> = list.iter().map(|n| n.order.order_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn remove_is_a_noop_for_missing_key() {
        let mut list = NodeList::new(NodeType::RestingLimit, SortDirection::Asc);
        list.remove(999, user(1));
        assert!(list.is_empty());
    }

    #[test]
    fn update_keeps_sort_position() {
        let mut list = NodeList::new(NodeType::RestingLimit, SortDirection::Asc);
        list.insert(order(1, 100), user(1));
        list.insert(order(2, 90), user(2));

        let mut updated = order(1, 100);
        updated.base_asset_amount_filled = 5;
        list.update(updated, user(1));

        let ids: Vec<u32> = list.iter().map(|n| n.order.order_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(list.get(1, user(1)).unwrap().order.base_asset_amount_filled, 5);
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let mut list = NodeList::new(NodeType::RestingLimit, SortDirection::Asc);
        list.insert(order(1, 100), user(1));
        list.insert(order(1, 50), user(1));

        assert_eq!(list.len(), 1);
        assert_eq!(list.get(1, user(1)).unwrap().order.price, 100);
    }
}
