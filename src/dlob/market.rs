//! `MarketBook`: the ten `NodeList`s for one `(market_type, market_index)`,
//! and `Exchange`: the per-market-type map of `MarketBook`s the `DLOB`
//! indexes all of its state through.

use dashmap::{DashMap, DashSet};

use crate::dlob::node::{NodeType, OrderKey};
use crate::dlob::node_list::{NodeList, SortDirection};
use crate::math::order::{is_resting_limit_order, is_triggered, must_be_triggered};
use crate::types::{MarketType, Order, OrderTriggerCondition, PositionDirection};

/// Which side of a `NodeList` (or, for trigger orders, which trigger
/// direction) an order belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
    Above,
    Below,
}

/// Classify `order` per the resting/taking/floating/market/trigger state
/// machine, returning the node type and the side of its host list.
pub fn classify_order(order: &Order, slot: u64) -> (NodeType, Side) {
    if must_be_triggered(order) && !is_triggered(order) {
        let side = match order.trigger_condition {
            OrderTriggerCondition::Above => Side::Above,
            _ => Side::Below,
        };
        return (NodeType::Trigger, side);
    }

    let side = match order.direction {
        PositionDirection::Long => Side::Bid,
        PositionDirection::Short => Side::Ask,
    };

    use crate::types::OrderType;
    if matches!(
        order.order_type,
        OrderType::Market | OrderType::TriggerMarket | OrderType::Oracle
    ) {
        return (NodeType::Market, side);
    }

    if order.oracle_price_offset != 0 {
        return (NodeType::FloatingLimit, side);
    }

    if is_resting_limit_order(order, slot) {
        (NodeType::RestingLimit, side)
    } else {
        (NodeType::TakingLimit, side)
    }
}

/// The ten `NodeList`s for one market: {resting_limit, floating_limit,
/// taking_limit, market} x {bid, ask}, plus {trigger_above, trigger_below}.
pub struct MarketBook {
    pub resting_limit_bids: NodeList,
    pub resting_limit_asks: NodeList,
    pub floating_limit_bids: NodeList,
    pub floating_limit_asks: NodeList,
    pub taking_limit_bids: NodeList,
    pub taking_limit_asks: NodeList,
    pub market_bids: NodeList,
    pub market_asks: NodeList,
    pub trigger_above: NodeList,
    pub trigger_below: NodeList,
}

impl MarketBook {
    pub fn new() -> Self {
        Self {
            resting_limit_bids: NodeList::new(NodeType::RestingLimit, SortDirection::Desc),
            resting_limit_asks: NodeList::new(NodeType::RestingLimit, SortDirection::Asc),
            floating_limit_bids: NodeList::new(NodeType::FloatingLimit, SortDirection::Desc),
            floating_limit_asks: NodeList::new(NodeType::FloatingLimit, SortDirection::Asc),
            taking_limit_bids: NodeList::new(NodeType::TakingLimit, SortDirection::Asc),
            taking_limit_asks: NodeList::new(NodeType::TakingLimit, SortDirection::Asc),
            market_bids: NodeList::new(NodeType::Market, SortDirection::Asc),
            market_asks: NodeList::new(NodeType::Market, SortDirection::Asc),
            trigger_above: NodeList::new(NodeType::Trigger, SortDirection::Asc),
            trigger_below: NodeList::new(NodeType::Trigger, SortDirection::Desc),
        }
    }

    /// The list `(node_type, side)` classifies into.
    pub fn list_for(&mut self, node_type: NodeType, side: Side) -> &mut NodeList {
        match (node_type, side) {
            (NodeType::RestingLimit, Side::Bid) => &mut self.resting_limit_bids,
            (NodeType::RestingLimit, _) => &mut self.resting_limit_asks,
            (NodeType::FloatingLimit, Side::Bid) => &mut self.floating_limit_bids,
            (NodeType::FloatingLimit, _) => &mut self.floating_limit_asks,
            (NodeType::TakingLimit, Side::Bid) => &mut self.taking_limit_bids,
            (NodeType::TakingLimit, _) => &mut self.taking_limit_asks,
            (NodeType::Market, Side::Bid) => &mut self.market_bids,
            (NodeType::Market, _) => &mut self.market_asks,
            (NodeType::Trigger, Side::Above) => &mut self.trigger_above,
            (NodeType::Trigger, _) => &mut self.trigger_below,
        }
    }

    pub fn all_lists(&self) -> [&NodeList; 10] {
        [
            &self.resting_limit_bids,
            &self.resting_limit_asks,
            &self.floating_limit_bids,
            &self.floating_limit_asks,
            &self.taking_limit_bids,
            &self.taking_limit_asks,
            &self.market_bids,
            &self.market_asks,
            &self.trigger_above,
            &self.trigger_below,
        ]
    }

    /// Non-trigger lists, used by expired-order discovery.
    pub fn non_trigger_lists(&self) -> [&NodeList; 8] {
        [
            &self.resting_limit_bids,
            &self.resting_limit_asks,
            &self.floating_limit_bids,
            &self.floating_limit_asks,
            &self.taking_limit_bids,
            &self.taking_limit_asks,
            &self.market_bids,
            &self.market_asks,
        ]
    }
}

impl Default for MarketBook {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-`market_type` table of `MarketBook`s by market index.
pub struct Exchange {
    pub perp: DashMap<u16, MarketBook>,
    pub spot: DashMap<u16, MarketBook>,
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            perp: DashMap::new(),
            spot: DashMap::new(),
        }
    }

    pub fn clear(&self) {
        self.perp.clear();
        self.spot.clear();
    }

    pub fn table(&self, market_type: MarketType) -> &DashMap<u16, MarketBook> {
        match market_type {
            MarketType::Perp => &self.perp,
            MarketType::Spot => &self.spot,
        }
    }

    pub fn ensure_market(&self, market_type: MarketType, market_index: u16) {
        self.table(market_type)
            .entry(market_index)
            .or_insert_with(MarketBook::new);
    }

    pub fn perp_size(&self) -> usize {
        self.perp.len()
    }

    pub fn spot_size(&self) -> usize {
        self.spot.len()
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of open-order keys per market type.
pub struct OpenOrders {
    pub perp: DashSet<OrderKey>,
    pub spot: DashSet<OrderKey>,
}

impl OpenOrders {
    pub fn new() -> Self {
        Self {
            perp: DashSet::new(),
            spot: DashSet::new(),
        }
    }

    pub fn set(&self, market_type: MarketType) -> &DashSet<OrderKey> {
        match market_type {
            MarketType::Perp => &self.perp,
            MarketType::Spot => &self.spot,
        }
    }

    pub fn clear(&self) {
        self.perp.clear();
        self.spot.clear();
    }
}

impl Default for OpenOrders {
    fn default() -> Self {
        Self::new()
    }
}
