//! `OrderNode`: an `Order` bound to a classification tag, with
//! classification-dependent effective-price dispatch. A single struct
//! carrying the tag rather than one type per classification, since the
//! dispatch is a handful of match arms rather than distinct behavior.

use crate::math::order::get_limit_price;
use crate::types::{Order, OraclePriceData, UserAccount};

/// `(order_id, user_account)` — unique identity of an order across the
/// whole DLOB.
pub type OrderKey = (u32, UserAccount);

pub fn order_key(order_id: u32, user_account: UserAccount) -> OrderKey {
    (order_id, user_account)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    RestingLimit,
    FloatingLimit,
    TakingLimit,
    Market,
    Trigger,
}

pub trait DLOBNode {
    /// Effective price at `(oracle, slot)`, or `None` for market/taking
    /// nodes, which sort by submission slot rather than price.
    fn effective_price(&self, oracle_price_data: &OraclePriceData, slot: u64) -> Option<i128>;
    fn is_base_filled(&self) -> bool;
    fn order(&self) -> &Order;
    fn user_account(&self) -> UserAccount;
    fn key(&self) -> OrderKey;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderNode {
    pub order: Order,
    pub user_account: UserAccount,
    pub node_type: NodeType,
}

impl OrderNode {
    pub fn new(node_type: NodeType, order: Order, user_account: UserAccount) -> Self {
        Self {
            order,
            user_account,
            node_type,
        }
    }
}

impl DLOBNode for OrderNode {
    fn effective_price(&self, oracle_price_data: &OraclePriceData, slot: u64) -> Option<i128> {
        match self.node_type {
            NodeType::Market | NodeType::TakingLimit => None,
            NodeType::Trigger => Some(self.order.trigger_price as i128),
            NodeType::RestingLimit | NodeType::FloatingLimit => {
                get_limit_price(&self.order, oracle_price_data, slot, None).map(|p| p as i128)
            }
        }
    }

    fn is_base_filled(&self) -> bool {
        self.order.is_base_filled()
    }

    fn order(&self) -> &Order {
        &self.order
    }

    fn user_account(&self) -> UserAccount {
        self.user_account
    }

    fn key(&self) -> OrderKey {
        order_key(self.order.order_id, self.user_account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;

    #[test]
    fn market_and_taking_nodes_have_no_effective_price() {
        let user = UserAccount::new([1; 32]);
        let market = OrderNode::new(NodeType::Market, Order::default(), user);
        let taking = OrderNode::new(NodeType::TakingLimit, Order::default(), user);
        let oracle = OraclePriceData {
            price: 100,
            confidence: 1,
            has_sufficient_number_of_data_points: true,
        };
        assert_eq!(market.effective_price(&oracle, 0), None);
        assert_eq!(taking.effective_price(&oracle, 0), None);
    }

    #[test]
    fn trigger_node_sorts_by_trigger_price() {
        let user = UserAccount::new([1; 32]);
        let order = Order {
            trigger_price: 555,
            order_type: OrderType::TriggerMarket,
            ..Order::default()
        };
        let node = OrderNode::new(NodeType::Trigger, order, user);
        let oracle = OraclePriceData {
            price: 0,
            confidence: 1,
            has_sufficient_number_of_data_points: true,
        };
        assert_eq!(node.effective_price(&oracle, 0), Some(555));
    }
}
