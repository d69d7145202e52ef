//! The `DLOB` itself: ingestion, the resting/taking promotion sweep, the
//! crossing/fallback/expiry/trigger matching algorithms, and the L2/L3/best
//! bid-ask query surface.

use fnv::FnvHashMap;
use rayon::prelude::*;

use crate::dlob::levels::{
    l2_levels_from_nodes, merge_levels, FallbackL2Generator, L2OrderBook, L3Level, L3OrderBook,
};
use crate::dlob::market::{classify_order, Exchange, OpenOrders, Side};
use crate::dlob::node::{order_key, DLOBNode, OrderKey, OrderNode};
use crate::math::exchange_status::{amm_paused, exchange_paused, fill_paused};
use crate::math::order::{get_limit_price, is_resting_limit_order};
use crate::records::{OrderAction, OrderActionRecord, OrderRecord, UserSnapshot};
use crate::types::{
    DlobError, DlobResult, MarketAccount, MarketType, Order, OraclePriceData, OrderStatus,
    OrderTriggerCondition, State, UserAccount,
};

const DEFAULT_ORACLE: OraclePriceData = OraclePriceData {
    price: 0,
    confidence: 0,
    has_sufficient_number_of_data_points: false,
};

/// A taker node paired with the makers it crosses (empty for a fallback-only
/// fill, which the caller fills against external liquidity).
#[derive(Debug, Clone)]
pub struct NodeToFill {
    pub node: OrderNode,
    pub maker_nodes: Vec<OrderNode>,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeToTrigger {
    pub node: OrderNode,
}

/// One entry of a merged best-bid/ask walk: either a live order, or the
/// single synthetic fallback level.
#[derive(Debug, Clone, Copy)]
pub enum BookEntry {
    Order(OrderNode),
    Fallback { price: i128 },
}

impl BookEntry {
    fn price(&self, oracle_price_data: Option<&OraclePriceData>, slot: u64) -> i128 {
        match self {
            BookEntry::Fallback { price } => *price,
            BookEntry::Order(node) => {
                let oracle = oracle_price_data.copied().unwrap_or(DEFAULT_ORACLE);
                node.effective_price(&oracle, slot).unwrap_or(i128::MAX)
            }
        }
    }
}

pub struct DLOB {
    exchange: Exchange,
    open_orders: OpenOrders,
    /// Maps every live order to the market it lives in, so `get_order`,
    /// `update_order`, `delete_order` and `trigger` don't need to scan every
    /// market.
    order_locations: dashmap::DashMap<OrderKey, (MarketType, u16)>,
    initialized: bool,
    max_slot_for_resting_limit_orders: u64,
}

impl DLOB {
    pub fn new() -> Self {
        Self {
            exchange: Exchange::new(),
            open_orders: OpenOrders::new(),
            order_locations: dashmap::DashMap::new(),
            initialized: false,
            max_slot_for_resting_limit_orders: 0,
        }
    }

    pub fn clear(&mut self) {
        self.exchange.clear();
        self.open_orders.clear();
        self.order_locations.clear();
        self.initialized = false;
        self.max_slot_for_resting_limit_orders = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn perp_market_count(&self) -> usize {
        self.exchange.perp_size()
    }

    pub fn spot_market_count(&self) -> usize {
        self.exchange.spot_size()
    }

    // ---- ingestion ----------------------------------------------------

    /// Bulk-load every user's open orders. Per-user insertion is independent
    /// (each user's orders only ever touch their own `OrderKey`s), so this
    /// shards across `rayon`'s pool rather than running single-threaded.
    pub fn init_from_snapshot(&mut self, users: &[UserSnapshot], slot: u64) -> DlobResult<()> {
        if self.initialized {
            return Err(DlobError::AlreadyInitialized);
        }
        self.clear();
        users.par_iter().for_each(|user| {
            for order in &user.orders {
                if order.status == OrderStatus::Init {
                    continue;
                }
                self.insert_order(order, user.user_account, slot);
            }
        });
        self.initialized = true;
        Ok(())
    }

    pub fn init_from_orders(&mut self, orders: &[OrderRecord], slot: u64) -> DlobResult<()> {
        if self.initialized {
            return Err(DlobError::AlreadyInitialized);
        }
        self.clear();
        orders.par_iter().for_each(|record| {
            if record.order.status != OrderStatus::Init {
                self.insert_order(&record.order, record.user_account, slot);
            }
        });
        self.initialized = true;
        Ok(())
    }

    pub fn handle_order_record(&self, record: &OrderRecord, slot: u64) {
        self.insert_order(&record.order, record.user_account, slot);
    }

    pub fn handle_order_action_record(&mut self, record: &OrderActionRecord, slot: u64) {
        match record.action {
            OrderAction::Place | OrderAction::Expire => {}
            OrderAction::Trigger => {
                if let Some(taker) = record.taker {
                    self.trigger(taker.order_id, taker.user_account, slot);
                }
                if let Some(maker) = record.maker {
                    self.trigger(maker.order_id, maker.user_account, slot);
                }
            }
            OrderAction::Fill => {
                if let (Some(taker), Some(filled)) =
                    (record.taker, record.taker_order_cumulative_base_asset_amount_filled)
                {
                    if let Some(order) = self.get_order(taker.order_id, taker.user_account) {
                        self.update_order(order, taker.user_account, slot, filled);
                    }
                }
                if let (Some(maker), Some(filled)) =
                    (record.maker, record.maker_order_cumulative_base_asset_amount_filled)
                {
                    if let Some(order) = self.get_order(maker.order_id, maker.user_account) {
                        self.update_order(order, maker.user_account, slot, filled);
                    }
                }
            }
            OrderAction::Cancel => {
                if let Some(taker) = record.taker {
                    if let Some(order) = self.get_order(taker.order_id, taker.user_account) {
                        self.delete_order(order, taker.user_account, slot);
                    }
                }
                if let Some(maker) = record.maker {
                    if let Some(order) = self.get_order(maker.order_id, maker.user_account) {
                        self.delete_order(order, maker.user_account, slot);
                    }
                }
            }
        }
    }

    /// Insert a freshly-seen order. Orders in `Init` status are never
    /// inserted; unrecognized order types can't occur since
    /// `OrderType` is closed.
    pub fn insert_order(&self, order: &Order, user_account: UserAccount, slot: u64) {
        if order.status == OrderStatus::Init {
            return;
        }

        self.exchange.ensure_market(order.market_type, order.market_index);

        if order.status == OrderStatus::Open {
            self.open_orders
                .set(order.market_type)
                .insert(order_key(order.order_id, user_account));
        }

        let (node_type, side) = classify_order(order, slot);
        if let Some(mut book) = self.exchange.table(order.market_type).get_mut(&order.market_index) {
            book.list_for(node_type, side).insert(*order, user_account);
        } else {
            log::warn!(
                "insert_order: no book for market_type={:?} market_index={}",
                order.market_type,
                order.market_index
            );
        }

        self.order_locations
            .insert(order_key(order.order_id, user_account), (order.market_type, order.market_index));
    }

    pub fn get_order(&self, order_id: u32, user_account: UserAccount) -> Option<Order> {
        let (market_type, market_index) = *self.order_locations.get(&order_key(order_id, user_account))?;
        let book = self.exchange.table(market_type).get(&market_index)?;
        for list in book.all_lists() {
            if let Some(node) = list.get(order_id, user_account) {
                return Some(node.order);
            }
        }
        None
    }

    /// Replace the stored order's fill amount. Fully filled orders are
    /// deleted outright; a no-op fill is ignored.
    pub fn update_order(&mut self, order: Order, user_account: UserAccount, slot: u64, new_cumulative_filled: u64) {
        self.update_resting_limit_orders(slot);

        if new_cumulative_filled == order.base_asset_amount {
            self.delete_order(order, user_account, slot);
            return;
        }
        if new_cumulative_filled == order.base_asset_amount_filled {
            return;
        }

        let mut updated = order;
        updated.base_asset_amount_filled = new_cumulative_filled;
        let (node_type, side) = classify_order(&updated, slot);

        if let Some(mut book) = self
            .exchange
            .table(order.market_type)
            .get_mut(&order.market_index)
        {
            book.list_for(node_type, side).update(updated, user_account);
        } else {
            log::warn!(
                "update_order: no book for market_type={:?} market_index={}",
                order.market_type,
                order.market_index
            );
        }
    }

    pub fn delete_order(&mut self, order: Order, user_account: UserAccount, slot: u64) {
        self.update_resting_limit_orders(slot);

        let (node_type, side) = classify_order(&order, slot);
        if let Some(mut book) = self
            .exchange
            .table(order.market_type)
            .get_mut(&order.market_index)
        {
            book.list_for(node_type, side).remove(order.order_id, user_account);
        } else {
            log::warn!(
                "delete_order: no book for market_type={:?} market_index={}",
                order.market_type,
                order.market_index
            );
        }

        self.open_orders
            .set(order.market_type)
            .remove(&order_key(order.order_id, user_account));
        self.order_locations.remove(&order_key(order.order_id, user_account));
    }

    /// Fire a trigger order: flip `Above`/`Below` to `TriggeredAbove`/
    /// `TriggeredBelow` and re-classify it into the general matching path.
    /// A missing order is ignored (it may already have been canceled).
    pub fn trigger(&mut self, order_id: u32, user_account: UserAccount, slot: u64) {
        self.update_resting_limit_orders(slot);

        let Some(location) = self
            .order_locations
            .get(&order_key(order_id, user_account))
            .map(|entry| *entry)
        else {
            log::trace!("trigger: order {order_id} not found, already canceled");
            return;
        };
        let (market_type, market_index) = location;

        let stored = {
            let Some(mut book) = self.exchange.table(market_type).get_mut(&market_index) else {
                log::warn!(
                    "trigger: no book for market_type={:?} market_index={}",
                    market_type,
                    market_index
                );
                return;
            };
            let found = book
                .trigger_above
                .get(order_id, user_account)
                .or_else(|| book.trigger_below.get(order_id, user_account))
                .map(|node| node.order);
            if found.is_some() {
                book.trigger_above.remove(order_id, user_account);
                book.trigger_below.remove(order_id, user_account);
            }
            found
        };

        let Some(mut order) = stored else { return };

        order.trigger_condition = match order.trigger_condition {
            OrderTriggerCondition::Above => OrderTriggerCondition::TriggeredAbove,
            OrderTriggerCondition::Below => OrderTriggerCondition::TriggeredBelow,
            other => other,
        };

        self.insert_order(&order, user_account, slot);
    }

    pub fn get_dlob_orders(&self) -> Vec<OrderRecord> {
        let mut out = Vec::new();
        for table in [&self.exchange.perp, &self.exchange.spot] {
            for entry in table.iter() {
                for list in entry.value().all_lists() {
                    for node in list.iter() {
                        out.push(OrderRecord {
                            user_account: node.user_account,
                            order: node.order,
                        });
                    }
                }
            }
        }
        out
    }

    // ---- slot-driven promotion -----------------------------------------

    /// Promote taking-limit orders whose auction window has elapsed into
    /// their resting-limit list. A no-op if `slot` isn't past the previous
    /// watermark.
    pub fn update_resting_limit_orders(&mut self, slot: u64) {
        if slot <= self.max_slot_for_resting_limit_orders {
            return;
        }
        self.max_slot_for_resting_limit_orders = slot;
        log::debug!("update_resting_limit_orders: advancing watermark to slot {slot}");
        self.promote_taking_to_resting(MarketType::Perp, slot);
        self.promote_taking_to_resting(MarketType::Spot, slot);
    }

    fn promote_taking_to_resting(&self, market_type: MarketType, slot: u64) {
        let mut promoted = 0usize;
        for mut entry in self.exchange.table(market_type).iter_mut() {
            let book = entry.value_mut();

            let newly_resting_bids: Vec<OrderNode> = book
                .taking_limit_bids
                .iter()
                .filter(|node| is_resting_limit_order(&node.order, slot))
                .copied()
                .collect();
            for node in newly_resting_bids {
                book.taking_limit_bids.remove(node.order.order_id, node.user_account);
                book.resting_limit_bids.insert(node.order, node.user_account);
                promoted += 1;
            }

            let newly_resting_asks: Vec<OrderNode> = book
                .taking_limit_asks
                .iter()
                .filter(|node| is_resting_limit_order(&node.order, slot))
                .copied()
                .collect();
            for node in newly_resting_asks {
                book.taking_limit_asks.remove(node.order.order_id, node.user_account);
                book.resting_limit_asks.insert(node.order, node.user_account);
                promoted += 1;
            }
        }
        log::trace!("promote_taking_to_resting: market_type={market_type:?} promoted {promoted} orders");
    }

    // ---- book queries ---------------------------------------------------

    fn taking_nodes(&self, market_type: MarketType, market_index: u16, side: Side) -> Vec<OrderNode> {
        let Some(book) = self.exchange.table(market_type).get(&market_index) else {
            return Vec::new();
        };
        let (market_list, taking_list) = match side {
            Side::Bid => (&book.market_bids, &book.taking_limit_bids),
            _ => (&book.market_asks, &book.taking_limit_asks),
        };
        let mut nodes: Vec<OrderNode> = market_list
            .iter()
            .chain(taking_list.iter())
            .filter(|node| !node.is_base_filled())
            .copied()
            .collect();
        nodes.sort_by_key(|node| node.order.slot);
        nodes
    }

    pub fn get_taking_asks(&mut self, slot: u64, market_type: MarketType, market_index: u16) -> Vec<OrderNode> {
        self.update_resting_limit_orders(slot);
        self.taking_nodes(market_type, market_index, Side::Ask)
    }

    pub fn get_taking_bids(&mut self, slot: u64, market_type: MarketType, market_index: u16) -> Vec<OrderNode> {
        self.update_resting_limit_orders(slot);
        self.taking_nodes(market_type, market_index, Side::Bid)
    }

    fn resting_nodes(&self, market_type: MarketType, market_index: u16, side: Side) -> Vec<OrderNode> {
        let Some(book) = self.exchange.table(market_type).get(&market_index) else {
            return Vec::new();
        };
        let (resting_list, floating_list) = match side {
            Side::Bid => (&book.resting_limit_bids, &book.floating_limit_bids),
            _ => (&book.resting_limit_asks, &book.floating_limit_asks),
        };
        resting_list
            .iter()
            .chain(floating_list.iter())
            .filter(|node| !node.is_base_filled())
            .copied()
            .collect()
    }

    /// Resting + floating-limit asks, price ascending. Spot markets require
    /// an oracle to rank floating-limit orders against fixed ones; a
    /// missing oracle fails with `MissingOracle`.
    pub fn get_resting_limit_asks(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: Option<&OraclePriceData>,
    ) -> DlobResult<Vec<OrderNode>> {
        self.update_resting_limit_orders(slot);
        if market_type == MarketType::Spot && oracle_price_data.is_none() {
            return Err(DlobError::MissingOracle);
        }
        let oracle = oracle_price_data.copied().unwrap_or(DEFAULT_ORACLE);
        let mut nodes = self.resting_nodes(market_type, market_index, Side::Ask);
        nodes.sort_by_key(|node| node.effective_price(&oracle, slot).unwrap_or(i128::MAX));
        Ok(nodes)
    }

    pub fn get_resting_limit_bids(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: Option<&OraclePriceData>,
    ) -> DlobResult<Vec<OrderNode>> {
        self.update_resting_limit_orders(slot);
        if market_type == MarketType::Spot && oracle_price_data.is_none() {
            return Err(DlobError::MissingOracle);
        }
        let oracle = oracle_price_data.copied().unwrap_or(DEFAULT_ORACLE);
        let mut nodes = self.resting_nodes(market_type, market_index, Side::Bid);
        nodes.sort_by_key(|node| std::cmp::Reverse(node.effective_price(&oracle, slot).unwrap_or(i128::MIN)));
        Ok(nodes)
    }

    /// Resting-limit bids that are safe makers for an opposing taker (perp
    /// only, if `fallback_ask` is supplied): a bid priced above the
    /// fallback ask would be a better fill against the fallback directly,
    /// so it's excluded here.
    fn get_maker_limit_bids(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: &OraclePriceData,
        fallback_ask: Option<i128>,
    ) -> DlobResult<Vec<OrderNode>> {
        let mut bids = self.get_resting_limit_bids(slot, market_type, market_index, Some(oracle_price_data))?;
        if market_type == MarketType::Perp {
            if let Some(fallback_ask) = fallback_ask {
                bids.retain(|node| node.effective_price(oracle_price_data, slot).unwrap_or(i128::MIN) <= fallback_ask);
            }
        }
        Ok(bids)
    }

    fn get_maker_limit_asks(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: &OraclePriceData,
        fallback_bid: Option<i128>,
    ) -> DlobResult<Vec<OrderNode>> {
        let mut asks = self.get_resting_limit_asks(slot, market_type, market_index, Some(oracle_price_data))?;
        if market_type == MarketType::Perp {
            if let Some(fallback_bid) = fallback_bid {
                asks.retain(|node| node.effective_price(oracle_price_data, slot).unwrap_or(i128::MAX) >= fallback_bid);
            }
        }
        Ok(asks)
    }

    /// Merged best-ask walk: taking nodes (slot order) first, then
    /// resting-limit nodes and (perp, if supplied) the synthetic fallback
    /// level, sorted by price.
    pub fn get_asks(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: Option<&OraclePriceData>,
        fallback_ask: Option<i128>,
    ) -> DlobResult<Vec<BookEntry>> {
        let taking = self.get_taking_asks(slot, market_type, market_index);
        let mut resting: Vec<BookEntry> = self
            .get_resting_limit_asks(slot, market_type, market_index, oracle_price_data)?
            .into_iter()
            .map(BookEntry::Order)
            .collect();
        if market_type == MarketType::Perp {
            if let Some(price) = fallback_ask {
                resting.push(BookEntry::Fallback { price });
            }
        }
        resting.sort_by_key(|entry| entry.price(oracle_price_data, slot));

        let mut out: Vec<BookEntry> = taking.into_iter().map(BookEntry::Order).collect();
        out.extend(resting);
        Ok(out)
    }

    pub fn get_bids(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: Option<&OraclePriceData>,
        fallback_bid: Option<i128>,
    ) -> DlobResult<Vec<BookEntry>> {
        let taking = self.get_taking_bids(slot, market_type, market_index);
        let mut resting: Vec<BookEntry> = self
            .get_resting_limit_bids(slot, market_type, market_index, oracle_price_data)?
            .into_iter()
            .map(BookEntry::Order)
            .collect();
        if market_type == MarketType::Perp {
            if let Some(price) = fallback_bid {
                resting.push(BookEntry::Fallback { price });
            }
        }
        resting.sort_by_key(|entry| std::cmp::Reverse(entry.price(oracle_price_data, slot)));

        let mut out: Vec<BookEntry> = taking.into_iter().map(BookEntry::Order).collect();
        out.extend(resting);
        Ok(out)
    }

    pub fn best_ask(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: Option<&OraclePriceData>,
        fallback_ask: Option<i128>,
    ) -> DlobResult<Option<BookEntry>> {
        Ok(self
            .get_asks(slot, market_type, market_index, oracle_price_data, fallback_ask)?
            .into_iter()
            .next())
    }

    pub fn best_bid(
        &mut self,
        slot: u64,
        market_type: MarketType,
        market_index: u16,
        oracle_price_data: Option<&OraclePriceData>,
        fallback_bid: Option<i128>,
    ) -> DlobResult<Option<BookEntry>> {
        Ok(self
            .get_bids(slot, market_type, market_index, oracle_price_data, fallback_bid)?
            .into_iter()
            .next())
    }

    // ---- matching ---------------------------------------------------

    /// Full fill discovery for one market: resting-vs-resting crossing,
    /// taking-vs-maker crossing, fallback crossings (perp, amm active), and
    /// expired orders. Perp results are deduplicated by taker key with
    /// maker lists unioned; spot results are returned as independent
    /// fills.
    #[allow(clippy::too_many_arguments)]
    pub fn find_nodes_to_fill(
        &mut self,
        market_index: u16,
        fallback_bid: Option<i128>,
        fallback_ask: Option<i128>,
        slot: u64,
        ts: i64,
        market_type: MarketType,
        oracle_price_data: &OraclePriceData,
        state_account: &State,
        market_account: &MarketAccount,
    ) -> DlobResult<Vec<NodeToFill>> {
        self.update_resting_limit_orders(slot);

        if fill_paused(state_account, market_account) {
            return Ok(Vec::new());
        }

        let is_amm_paused = amm_paused(state_account, market_account);
        let min_auction_duration = if market_type == MarketType::Perp {
            state_account.min_perp_auction_duration
        } else {
            0
        };
        let (rebate_numerator, rebate_denominator) = maker_rebate(state_account, market_account, market_type);

        let mut filled: FnvHashMap<OrderKey, u64> = FnvHashMap::default();

        let mut resting =
            self.find_crossing_resting_limit_orders(market_index, slot, market_type, oracle_price_data, &mut filled)?;

        if !is_amm_paused {
            if let Some(fallback_bid) = fallback_bid {
                let buffered = apply_rebate_buffer(fallback_bid, rebate_numerator, rebate_denominator);
                let asks = self.get_resting_limit_asks(slot, market_type, market_index, Some(oracle_price_data))?;
                resting.extend(find_nodes_crossing_fallback_liquidity(
                    market_type,
                    slot,
                    oracle_price_data,
                    &asks,
                    buffered,
                    true,
                    min_auction_duration,
                    &filled,
                ));
            }
            if let Some(fallback_ask) = fallback_ask {
                let buffered = apply_rebate_buffer(fallback_ask, rebate_numerator, rebate_denominator);
                let bids = self.get_resting_limit_bids(slot, market_type, market_index, Some(oracle_price_data))?;
                resting.extend(find_nodes_crossing_fallback_liquidity(
                    market_type,
                    slot,
                    oracle_price_data,
                    &bids,
                    buffered,
                    false,
                    min_auction_duration,
                    &filled,
                ));
            }
        }

        let mut taking = self.find_taking_nodes_to_fill(
            market_index,
            slot,
            market_type,
            oracle_price_data,
            fallback_bid,
            fallback_ask,
            &mut filled,
        )?;

        if !is_amm_paused && market_type == MarketType::Perp {
            taking.extend(self.find_taking_nodes_crossing_fallback(
                market_index,
                slot,
                market_type,
                oracle_price_data,
                fallback_bid,
                fallback_ask,
                min_auction_duration,
                &filled,
            )?);
        }

        let expired = self.find_expired_nodes_to_fill(market_index, ts, market_type);

        let result = match market_type {
            MarketType::Spot => {
                let mut all = resting;
                all.extend(taking);
                all.extend(expired);
                all
            }
            MarketType::Perp => {
                let mut merged = merge_nodes_to_fill(resting, taking);
                merged.extend(expired);
                merged
            }
        };

        Ok(result)
    }

    /// Cross resting-limit asks against resting-limit bids, best price
    /// first on both sides, breaking the inner loop the moment a bid no
    /// longer crosses the current ask (both sides are price-sorted, so
    /// nothing further down either side can cross either).
    fn find_crossing_resting_limit_orders(
        &mut self,
        market_index: u16,
        slot: u64,
        market_type: MarketType,
        oracle_price_data: &OraclePriceData,
        filled: &mut FnvHashMap<OrderKey, u64>,
    ) -> DlobResult<Vec<NodeToFill>> {
        let asks = self.get_resting_limit_asks(slot, market_type, market_index, Some(oracle_price_data))?;
        let bids = self.get_resting_limit_bids(slot, market_type, market_index, Some(oracle_price_data))?;

        let mut nodes_to_fill = Vec::new();
        for ask in &asks {
            if simulated_is_base_filled(&ask.order, filled, ask.key()) {
                continue;
            }
            let ask_price = ask.effective_price(oracle_price_data, slot).unwrap_or(0);

            for bid in &bids {
                if simulated_is_base_filled(&bid.order, filled, bid.key()) {
                    continue;
                }
                let bid_price = bid.effective_price(oracle_price_data, slot).unwrap_or(0);
                if bid_price < ask_price {
                    break;
                }
                if ask.user_account == bid.user_account {
                    continue;
                }

                let Some((taker, maker)) = determine_maker_and_taker(*ask, *bid) else {
                    continue;
                };

                let base_filled = remaining(&bid.order, filled, bid.key()).min(remaining(&ask.order, filled, ask.key()));
                if base_filled == 0 {
                    continue;
                }
                record_fill(filled, &bid.order, bid.key(), base_filled);
                record_fill(filled, &ask.order, ask.key(), base_filled);
                nodes_to_fill.push(NodeToFill {
                    node: taker,
                    maker_nodes: vec![maker],
                });

                if simulated_is_base_filled(&ask.order, filled, ask.key()) {
                    break;
                }
            }
        }
        Ok(nodes_to_fill)
    }

    /// Taking (market + still-in-auction limit) orders crossing resting
    /// makers on the opposite side.
    fn find_taking_nodes_to_fill(
        &mut self,
        market_index: u16,
        slot: u64,
        market_type: MarketType,
        oracle_price_data: &OraclePriceData,
        fallback_bid: Option<i128>,
        fallback_ask: Option<i128>,
        filled: &mut FnvHashMap<OrderKey, u64>,
    ) -> DlobResult<Vec<NodeToFill>> {
        let mut nodes_to_fill = Vec::new();

        let taking_asks = self.get_taking_asks(slot, market_type, market_index);
        let maker_bids = self.get_maker_limit_bids(slot, market_type, market_index, oracle_price_data, fallback_ask)?;
        match_taking_side(
            &taking_asks,
            &maker_bids,
            true,
            market_type,
            fallback_bid,
            oracle_price_data,
            slot,
            filled,
            &mut nodes_to_fill,
        );

        let taking_bids = self.get_taking_bids(slot, market_type, market_index);
        let maker_asks = self.get_maker_limit_asks(slot, market_type, market_index, oracle_price_data, fallback_bid)?;
        match_taking_side(
            &taking_bids,
            &maker_asks,
            false,
            market_type,
            fallback_ask,
            oracle_price_data,
            slot,
            filled,
            &mut nodes_to_fill,
        );

        Ok(nodes_to_fill)
    }

    /// Takers (market + taking-limit) crossing the fallback price directly,
    /// once their own auction has run long enough that fallback liquidity
    /// is a legitimate counterparty.
    #[allow(clippy::too_many_arguments)]
    fn find_taking_nodes_crossing_fallback(
        &mut self,
        market_index: u16,
        slot: u64,
        market_type: MarketType,
        oracle_price_data: &OraclePriceData,
        fallback_bid: Option<i128>,
        fallback_ask: Option<i128>,
        min_auction_duration: u8,
        filled: &FnvHashMap<OrderKey, u64>,
    ) -> DlobResult<Vec<NodeToFill>> {
        let mut out = Vec::new();

        if let Some(fallback_bid) = fallback_bid {
            for node in self.get_taking_asks(slot, market_type, market_index) {
                if simulated_is_base_filled(&node.order, filled, node.key()) {
                    continue;
                }
                let price = get_limit_price(&node.order, oracle_price_data, slot, None).map(|p| p as i128);
                if crosses(price, fallback_bid, true)
                    && crate::math::auction::is_fallback_available_liquidity_source(&node.order, min_auction_duration, slot)
                {
                    out.push(NodeToFill { node, maker_nodes: vec![] });
                }
            }
        }

        if let Some(fallback_ask) = fallback_ask {
            for node in self.get_taking_bids(slot, market_type, market_index) {
                if simulated_is_base_filled(&node.order, filled, node.key()) {
                    continue;
                }
                let price = get_limit_price(&node.order, oracle_price_data, slot, None).map(|p| p as i128);
                if crosses(price, fallback_ask, false)
                    && crate::math::auction::is_fallback_available_liquidity_source(&node.order, min_auction_duration, slot)
                {
                    out.push(NodeToFill { node, maker_nodes: vec![] });
                }
            }
        }

        Ok(out)
    }

    /// Resting orders whose `max_ts` has elapsed.
    /// Not subject to `filled` deduplication: expiry is independent of
    /// whatever else is being matched this call.
    fn find_expired_nodes_to_fill(&self, market_index: u16, ts: i64, market_type: MarketType) -> Vec<NodeToFill> {
        let mut out = Vec::new();
        if let Some(book) = self.exchange.table(market_type).get(&market_index) {
            for list in book.non_trigger_lists() {
                for node in list.iter() {
                    if node.order.max_ts != 0 && node.order.max_ts < ts {
                        out.push(NodeToFill {
                            node: *node,
                            maker_nodes: vec![],
                        });
                    }
                }
            }
        }
        out
    }

    /// JIT-auction candidates: takers still inside their own auction window
    /// paired with the best opposing resting-limit maker, using the same
    /// crossing rule as ordinary taking-vs-maker matching.
    pub fn find_jit_auction_nodes_to_fill(
        &mut self,
        market_index: u16,
        slot: u64,
        market_type: MarketType,
        oracle_price_data: &OraclePriceData,
    ) -> DlobResult<Vec<NodeToFill>> {
        self.update_resting_limit_orders(slot);
        let mut out = Vec::new();

        let in_auction = |node: &OrderNode| slot <= node.order.slot + node.order.auction_duration as u64;

        let taking_asks: Vec<OrderNode> = self
            .get_taking_asks(slot, market_type, market_index)
            .into_iter()
            .filter(in_auction)
            .collect();
        let maker_bids = self.get_resting_limit_bids(slot, market_type, market_index, Some(oracle_price_data))?;
        for ask in &taking_asks {
            let ask_price = get_limit_price(&ask.order, oracle_price_data, slot, None).map(|p| p as i128);
            if let Some(bid) = maker_bids.iter().find(|bid| bid.user_account != ask.user_account) {
                let bid_price = bid.effective_price(oracle_price_data, slot).unwrap_or(0);
                if crosses(ask_price, bid_price, true) {
                    out.push(NodeToFill {
                        node: *ask,
                        maker_nodes: vec![*bid],
                    });
                }
            }
        }

        let taking_bids: Vec<OrderNode> = self
            .get_taking_bids(slot, market_type, market_index)
            .into_iter()
            .filter(in_auction)
            .collect();
        let maker_asks = self.get_resting_limit_asks(slot, market_type, market_index, Some(oracle_price_data))?;
        for bid in &taking_bids {
            let bid_price = get_limit_price(&bid.order, oracle_price_data, slot, None).map(|p| p as i128);
            if let Some(ask) = maker_asks.iter().find(|ask| ask.user_account != bid.user_account) {
                let ask_price = ask.effective_price(oracle_price_data, slot).unwrap_or(0);
                if crosses(bid_price, ask_price, false) {
                    out.push(NodeToFill {
                        node: *bid,
                        maker_nodes: vec![*ask],
                    });
                }
            }
        }

        Ok(out)
    }

    /// Trigger orders whose condition `oracle_price` now satisfies, best
    /// (closest-to-firing) first, stopping at the first node that doesn't
    /// fire since both trigger lists are sorted by trigger price.
    pub fn find_nodes_to_trigger(
        &self,
        market_index: u16,
        oracle_price: i64,
        market_type: MarketType,
        state_account: &State,
    ) -> Vec<NodeToTrigger> {
        if exchange_paused(state_account) {
            return Vec::new();
        }
        let Some(book) = self.exchange.table(market_type).get(&market_index) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for node in book.trigger_above.iter() {
            if oracle_price > node.order.trigger_price as i64 {
                out.push(NodeToTrigger { node: *node });
            } else {
                break;
            }
        }
        for node in book.trigger_below.iter() {
            if oracle_price < node.order.trigger_price as i64 {
                out.push(NodeToTrigger { node: *node });
            } else {
                break;
            }
        }
        out
    }

    // ---- L2 / L3 ---------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn get_l2(
        &mut self,
        market_index: u16,
        market_type: MarketType,
        slot: u64,
        oracle_price_data: &OraclePriceData,
        depth: usize,
        fallback_generators: &mut [Box<dyn FallbackL2Generator>],
    ) -> DlobResult<L2OrderBook> {
        self.update_resting_limit_orders(slot);

        let maker_asks = self.get_resting_limit_asks(slot, market_type, market_index, Some(oracle_price_data))?;
        let mut ask_streams = vec![l2_levels_from_nodes(maker_asks.iter(), oracle_price_data, slot)];
        for generator in fallback_generators.iter_mut() {
            ask_streams.push(generator.l2_asks());
        }
        let asks = merge_levels(ask_streams, |a, b| a.price < b.price, depth);

        let maker_bids = self.get_resting_limit_bids(slot, market_type, market_index, Some(oracle_price_data))?;
        let mut bid_streams = vec![l2_levels_from_nodes(maker_bids.iter(), oracle_price_data, slot)];
        for generator in fallback_generators.iter_mut() {
            bid_streams.push(generator.l2_bids());
        }
        let bids = merge_levels(bid_streams, |a, b| a.price > b.price, depth);

        Ok(L2OrderBook { asks, bids, slot })
    }

    pub fn get_l3(
        &mut self,
        market_index: u16,
        market_type: MarketType,
        slot: u64,
        oracle_price_data: &OraclePriceData,
    ) -> DlobResult<L3OrderBook> {
        self.update_resting_limit_orders(slot);

        let asks = self
            .get_resting_limit_asks(slot, market_type, market_index, Some(oracle_price_data))?
            .into_iter()
            .map(|node| to_l3_level(&node, oracle_price_data, slot))
            .collect();
        let bids = self
            .get_resting_limit_bids(slot, market_type, market_index, Some(oracle_price_data))?
            .into_iter()
            .map(|node| to_l3_level(&node, oracle_price_data, slot))
            .collect();

        Ok(L3OrderBook { asks, bids, slot })
    }
}

impl Default for DLOB {
    fn default() -> Self {
        Self::new()
    }
}

fn to_l3_level(node: &OrderNode, oracle_price_data: &OraclePriceData, slot: u64) -> L3Level {
    L3Level {
        price: node.effective_price(oracle_price_data, slot).unwrap_or(0),
        size: node.order.base_asset_amount_remaining(),
        maker: node.user_account,
        order_id: node.order.order_id,
    }
}

/// Who's maker, who's taker, when an ask and a bid cross. Post-only orders
/// never take; between two non-post-only orders, whichever side's auction
/// completes first is the maker — on a tie (or when the ask's auction
/// completes later), the ask defaults to maker. `None` if both sides are
/// post-only, which can't legitimately cross. Callers shouldn't rely on the
/// tie-break itself, only on one side ending up maker and the other taker.
fn determine_maker_and_taker(ask: OrderNode, bid: OrderNode) -> Option<(OrderNode, OrderNode)> {
    if bid.order.post_only && ask.order.post_only {
        return None;
    }
    if bid.order.post_only {
        return Some((ask, bid));
    }
    if ask.order.post_only {
        return Some((bid, ask));
    }

    let ask_complete = ask.order.slot + ask.order.auction_duration as u64;
    let bid_complete = bid.order.slot + bid.order.auction_duration as u64;
    if ask_complete < bid_complete {
        Some((bid, ask))
    } else {
        Some((ask, bid))
    }
}

/// `true` if `price` crosses `threshold` for a taker on the named side —
/// `None` (no limit price, i.e. a plain market order) always crosses.
fn crosses(price: Option<i128>, threshold: i128, is_ask_taker: bool) -> bool {
    match price {
        None => true,
        Some(p) => {
            if is_ask_taker {
                p <= threshold
            } else {
                p >= threshold
            }
        }
    }
}

/// On spot markets, a taker with no limit price never crosses, and a maker
/// priced beyond the same-side fallback is excluded entirely (it should
/// trade against the fallback, not the taker).
fn does_cross_maker(
    market_type: MarketType,
    taker_price: Option<i128>,
    maker_price: i128,
    same_side_fallback: Option<i128>,
    is_ask_taker: bool,
) -> bool {
    if market_type == MarketType::Spot {
        if taker_price.is_none() {
            return false;
        }
        if let Some(fallback) = same_side_fallback {
            if is_ask_taker && maker_price < fallback {
                return false;
            }
            if !is_ask_taker && maker_price > fallback {
                return false;
            }
        }
    }
    crosses(taker_price, maker_price, is_ask_taker)
}

#[allow(clippy::too_many_arguments)]
fn match_taking_side(
    takers: &[OrderNode],
    makers: &[OrderNode],
    taker_is_ask: bool,
    market_type: MarketType,
    same_side_fallback: Option<i128>,
    oracle_price_data: &OraclePriceData,
    slot: u64,
    filled: &mut FnvHashMap<OrderKey, u64>,
    nodes_to_fill: &mut Vec<NodeToFill>,
) {
    for taker in takers {
        if simulated_is_base_filled(&taker.order, filled, taker.key()) {
            continue;
        }
        let taker_price = get_limit_price(&taker.order, oracle_price_data, slot, None).map(|p| p as i128);
        if market_type == MarketType::Spot && taker_price.is_none() {
            continue;
        }

        for maker in makers {
            if maker.user_account == taker.user_account {
                continue;
            }
            if simulated_is_base_filled(&maker.order, filled, maker.key()) {
                continue;
            }
            let maker_price = maker.effective_price(oracle_price_data, slot).unwrap_or(0);

            if !does_cross_maker(market_type, taker_price, maker_price, same_side_fallback, taker_is_ask) {
                // Market/taking orders are slot-sorted rather than
                // price-sorted, so this doesn't guarantee no later maker
                // crosses — preserved from the source.
                break;
            }

            let base_filled = remaining(&taker.order, filled, taker.key()).min(remaining(&maker.order, filled, maker.key()));
            if base_filled == 0 {
                continue;
            }
            record_fill(filled, &taker.order, taker.key(), base_filled);
            record_fill(filled, &maker.order, maker.key(), base_filled);
            nodes_to_fill.push(NodeToFill {
                node: *taker,
                maker_nodes: vec![*maker],
            });

            if simulated_is_base_filled(&taker.order, filled, taker.key()) {
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn find_nodes_crossing_fallback_liquidity(
    market_type: MarketType,
    slot: u64,
    oracle_price_data: &OraclePriceData,
    nodes: &[OrderNode],
    fallback_threshold: i128,
    is_ask_side: bool,
    min_auction_duration: u8,
    filled: &FnvHashMap<OrderKey, u64>,
) -> Vec<NodeToFill> {
    let mut out = Vec::new();
    for node in nodes {
        if market_type == MarketType::Spot && node.order.post_only {
            continue;
        }
        if simulated_is_base_filled(&node.order, filled, node.key()) {
            continue;
        }
        let price = get_limit_price(&node.order, oracle_price_data, slot, None).map(|p| p as i128);
        if !crosses(price, fallback_threshold, is_ask_side) {
            continue;
        }
        let fallback_available = market_type == MarketType::Spot
            || crate::math::auction::is_fallback_available_liquidity_source(&node.order, min_auction_duration, slot);
        if fallback_available {
            out.push(NodeToFill {
                node: *node,
                maker_nodes: vec![],
            });
        }
    }
    out
}

/// Combine resting- and taking-crossing results for perp markets: the same
/// taker can appear in both passes, so dedupe by taker key and union the
/// maker lists.
fn merge_nodes_to_fill(a: Vec<NodeToFill>, b: Vec<NodeToFill>) -> Vec<NodeToFill> {
    let mut merged: Vec<NodeToFill> = Vec::new();
    let mut index: FnvHashMap<OrderKey, usize> = FnvHashMap::default();
    for entry in a.into_iter().chain(b) {
        let key = entry.node.key();
        if let Some(&i) = index.get(&key) {
            merged[i].maker_nodes.extend(entry.maker_nodes);
        } else {
            index.insert(key, merged.len());
            merged.push(entry);
        }
    }
    merged
}

fn remaining(order: &Order, filled: &FnvHashMap<OrderKey, u64>, key: OrderKey) -> u64 {
    let simulated_filled = filled.get(&key).copied().unwrap_or(order.base_asset_amount_filled);
    order.base_asset_amount.saturating_sub(simulated_filled)
}

fn record_fill(filled: &mut FnvHashMap<OrderKey, u64>, order: &Order, key: OrderKey, amount: u64) {
    let current = filled.get(&key).copied().unwrap_or(order.base_asset_amount_filled);
    filled.insert(key, current + amount);
}

fn simulated_is_base_filled(order: &Order, filled: &FnvHashMap<OrderKey, u64>, key: OrderKey) -> bool {
    remaining(order, filled, key) == 0
}

fn apply_rebate_buffer(price: i128, numerator: u32, denominator: u32) -> i128 {
    if denominator == 0 {
        return price;
    }
    price - (price * numerator as i128) / denominator as i128
}

/// Maker-rebate numerator/denominator for the fallback-crossing buffer,
/// widened by the market's `fee_adjustment` percentage. `fee_adjustment` is
/// cast to `u32` directly rather than clamped, so a negative adjustment
/// wraps rather than floors at zero.
fn maker_rebate(state_account: &State, market_account: &MarketAccount, market_type: MarketType) -> (u32, u32) {
    let (mut numerator, denominator) = state_account.maker_rebate(market_type);
    let fee_adjustment = match market_account {
        MarketAccount::Perp(perp) => perp.fee_adjustment,
        MarketAccount::Spot(_) => 0,
    };
    if fee_adjustment != 0 {
        numerator = numerator.wrapping_add((denominator.wrapping_mul(fee_adjustment as u32)) / 100);
    }
    (numerator, denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, PositionDirection};

    fn user(n: u8) -> UserAccount {
        UserAccount::new([n; 32])
    }

    fn oracle(price: i64) -> OraclePriceData {
        OraclePriceData {
            price,
            confidence: 1,
            has_sufficient_number_of_data_points: true,
        }
    }

    fn limit_order(id: u32, direction: PositionDirection, price: u64, amount: u64) -> Order {
        Order {
            order_id: id,
            order_type: OrderType::Limit,
            direction,
            price,
            base_asset_amount: amount,
            post_only: true,
            ..Order::default()
        }
    }

    #[test]
    fn self_cross_is_rejected() {
        let mut dlob = DLOB::new();
        let trader = user(1);
        dlob.insert_order(&limit_order(1, PositionDirection::Long, 100, 10), trader, 0);
        dlob.insert_order(&limit_order(2, PositionDirection::Short, 100, 10), trader, 0);

        let state = State::default();
        let market = MarketAccount::Perp(crate::types::PerpMarket::default());
        let fills = dlob
            .find_nodes_to_fill(0, None, None, 0, 0, MarketType::Perp, &oracle(100), &state, &market)
            .unwrap();
        assert!(fills.is_empty());
    }

    #[test]
    fn crossing_limit_orders_fill_price_time_priority() {
        let mut dlob = DLOB::new();
        let buyer = user(1);
        let better_seller = user(2);
        let worse_seller = user(3);

        dlob.insert_order(&limit_order(1, PositionDirection::Long, 105, 10), buyer, 0);
        dlob.insert_order(&limit_order(2, PositionDirection::Short, 100, 10), better_seller, 0);
        dlob.insert_order(&limit_order(3, PositionDirection::Short, 102, 10), worse_seller, 0);

        let state = State::default();
        let market = MarketAccount::Perp(crate::types::PerpMarket::default());
        let fills = dlob
            .find_nodes_to_fill(0, None, None, 0, 0, MarketType::Perp, &oracle(100), &state, &market)
            .unwrap();

        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].maker_nodes[0].user_account, better_seller);
    }

    #[test]
    fn taking_limit_order_promotes_to_resting_after_auction() {
        let _ = env_logger::try_init();
        let mut dlob = DLOB::new();
        let mut order = limit_order(1, PositionDirection::Long, 100, 10);
        order.post_only = false;
        order.slot = 10;
        order.auction_duration = 5;
        dlob.insert_order(&order, user(1), 10);

        let taking = dlob.get_taking_bids(14, MarketType::Perp, 0);
        assert_eq!(taking.len(), 1);

        let resting = dlob
            .get_resting_limit_bids(16, MarketType::Perp, 0, Some(&oracle(100)))
            .unwrap();
        assert_eq!(resting.len(), 1);
        let taking_after = dlob.get_taking_bids(16, MarketType::Perp, 0);
        assert!(taking_after.is_empty());
    }

    #[test]
    fn fallback_crossing_resting_ask() {
        let mut dlob = DLOB::new();
        dlob.insert_order(&limit_order(1, PositionDirection::Short, 98, 10), user(1), 0);

        let state = State::default();
        let market = MarketAccount::Perp(crate::types::PerpMarket::default());
        let fills = dlob
            .find_nodes_to_fill(0, Some(99), None, 0, 0, MarketType::Perp, &oracle(98), &state, &market)
            .unwrap();

        assert_eq!(fills.len(), 1);
        assert!(fills[0].maker_nodes.is_empty());
    }

    #[test]
    fn trigger_order_fires_once_oracle_crosses() {
        let mut dlob = DLOB::new();
        let order = Order {
            order_id: 1,
            order_type: OrderType::TriggerMarket,
            direction: PositionDirection::Long,
            trigger_condition: OrderTriggerCondition::Above,
            trigger_price: 100,
            base_asset_amount: 5,
            ..Order::default()
        };
        dlob.insert_order(&order, user(1), 0);

        let state = State::default();
        assert!(dlob.find_nodes_to_trigger(0, 90, MarketType::Perp, &state).is_empty());
        let fired = dlob.find_nodes_to_trigger(0, 150, MarketType::Perp, &state);
        assert_eq!(fired.len(), 1);

        dlob.trigger(1, user(1), 0);
        let stored = dlob.get_order(1, user(1)).unwrap();
        assert_eq!(stored.trigger_condition, OrderTriggerCondition::TriggeredAbove);
    }

    #[test]
    fn l2_depth_is_respected() {
        let mut dlob = DLOB::new();
        for i in 0..5u32 {
            dlob.insert_order(
                &limit_order(i, PositionDirection::Short, 100 + i as u64, 1),
                user(i as u8 + 1),
                0,
            );
        }
        let book = dlob.get_l2(0, MarketType::Perp, 0, &oracle(100), 3, &mut []).unwrap();
        assert_eq!(book.asks.len(), 3);
        assert_eq!(book.asks[0].price, 100);
    }

    #[test]
    fn query_methods_do_not_mutate_resting_state() {
        let mut dlob = DLOB::new();
        let buyer = user(1);
        let seller = user(2);
        dlob.insert_order(&limit_order(1, PositionDirection::Long, 105, 10), buyer, 0);
        dlob.insert_order(&limit_order(2, PositionDirection::Short, 100, 10), seller, 0);

        let state = State::default();
        let market = MarketAccount::Perp(crate::types::PerpMarket::default());

        let first = dlob
            .find_nodes_to_fill(0, None, None, 0, 0, MarketType::Perp, &oracle(100), &state, &market)
            .unwrap();
        let second = dlob
            .find_nodes_to_fill(0, None, None, 0, 0, MarketType::Perp, &oracle(100), &state, &market)
            .unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(dlob.get_order(1, buyer).unwrap().base_asset_amount_filled, 0);
        assert_eq!(dlob.get_order(2, seller).unwrap().base_asset_amount_filled, 0);
    }
}
