use crate::math::auction::{get_auction_price, is_auction_complete};
use crate::types::{Order, OraclePriceData, OrderStatus, OrderTriggerCondition, OrderType, PositionDirection};

/// Resolve an order's limit price: oracle offset wins, then an in-flight
/// auction's interpolated price, then the order's own fixed price (or
/// `fallback_price` / `None` if that is also zero).
pub fn get_limit_price(
    order: &Order,
    oracle_price_data: &OraclePriceData,
    slot: u64,
    fallback_price: Option<u64>,
) -> Option<u64> {
    if order.oracle_price_offset != 0 {
        let price = oracle_price_data.price as i128 + order.oracle_price_offset as i128;
        return Some(price.max(0) as u64);
    }

    if has_auction_price(order, slot) {
        let price = get_auction_price(order, slot, oracle_price_data.price);
        return Some(price.max(0) as u64);
    }

    if order.price == 0 {
        return fallback_price;
    }

    Some(order.price)
}

fn has_auction_price(order: &Order, slot: u64) -> bool {
    !is_auction_complete(order, slot)
        && (order.auction_start_price != 0 || order.auction_end_price != 0)
}

pub fn must_be_triggered(order: &Order) -> bool {
    matches!(order.order_type, OrderType::TriggerMarket | OrderType::TriggerLimit)
}

pub fn is_triggered(order: &Order) -> bool {
    matches!(
        order.trigger_condition,
        OrderTriggerCondition::TriggeredAbove | OrderTriggerCondition::TriggeredBelow
    )
}

/// §4.2's resting-limit predicate: post-only orders rest from inception;
/// otherwise a limit/trigger-limit order rests once its auction window has
/// elapsed, with a trigger-limit order additionally required to have its
/// trigger on the "wrong side" of its own limit price excluded.
pub fn is_resting_limit_order(order: &Order, slot: u64) -> bool {
    if !order.is_limit_order() {
        return false;
    }

    if order.order_type == OrderType::TriggerLimit {
        return match order.direction {
            PositionDirection::Long if order.trigger_price < order.price => false,
            PositionDirection::Short if order.trigger_price > order.price => false,
            _ => is_auction_complete(order, slot),
        };
    }

    order.post_only || is_auction_complete(order, slot)
}

/// Complement of `is_resting_limit_order` for fixed-price limit orders
/// still inside their auction window (§4.2 "Taking-Limit").
pub fn is_taking_order(order: &Order, slot: u64) -> bool {
    order.is_limit_order() && !order.post_only && !is_resting_limit_order(order, slot)
}

/// `max_ts != 0 && max_ts < ts`, with an optional enforcement buffer for
/// limit orders. Trigger orders that haven't fired and non-open orders
/// never expire.
pub fn is_order_expired(
    order: &Order,
    ts: i64,
    enforce_buffer: Option<bool>,
    buffer_seconds: Option<i64>,
) -> bool {
    if must_be_triggered(order) || order.status != OrderStatus::Open || order.max_ts == 0 {
        return false;
    }

    let enforce_buffer = enforce_buffer.unwrap_or(false);
    let buffer_seconds = buffer_seconds.unwrap_or(15);

    let max_ts = if enforce_buffer && order.is_limit_order() {
        order.max_ts + buffer_seconds
    } else {
        order.max_ts
    };

    ts > max_ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn oracle(price: i64) -> OraclePriceData {
        OraclePriceData {
            price,
            confidence: 1,
            has_sufficient_number_of_data_points: true,
        }
    }

    #[test]
    fn floating_limit_tracks_oracle_offset() {
        let order = Order {
            oracle_price_offset: -50,
            order_type: OrderType::Limit,
            ..Order::default()
        };
        assert_eq!(get_limit_price(&order, &oracle(1_000), 5, None), Some(950));
    }

    #[test]
    fn auction_price_used_while_in_auction() {
        let order = Order {
            order_type: OrderType::Limit,
            slot: 10,
            auction_duration: 10,
            auction_start_price: 100,
            auction_end_price: 200,
            ..Order::default()
        };
        assert_eq!(get_limit_price(&order, &oracle(0), 15, None), Some(150));
    }

    #[test]
    fn zero_price_falls_back() {
        let order = Order {
            order_type: OrderType::Limit,
            price: 0,
            ..Order::default()
        };
        assert_eq!(get_limit_price(&order, &oracle(0), 0, Some(42)), Some(42));
        assert_eq!(get_limit_price(&order, &oracle(0), 0, None), None);
    }

    #[test]
    fn post_only_order_rests_immediately() {
        let order = Order {
            order_type: OrderType::Limit,
            post_only: true,
            slot: 100,
            auction_duration: 50,
            ..Order::default()
        };
        assert!(is_resting_limit_order(&order, 100));
    }

    #[test]
    fn fixed_limit_rests_after_auction_elapses() {
        let order = Order {
            order_type: OrderType::Limit,
            slot: 10,
            auction_duration: 5,
            market_type: MarketType::Perp,
            ..Order::default()
        };
        assert!(!is_resting_limit_order(&order, 14));
        assert!(is_resting_limit_order(&order, 16));
        assert!(is_taking_order(&order, 14));
        assert!(!is_taking_order(&order, 16));
    }

    #[test]
    fn trigger_limit_excluded_when_trigger_crosses_limit() {
        let order = Order {
            order_type: OrderType::TriggerLimit,
            direction: PositionDirection::Long,
            price: 100,
            trigger_price: 50,
            slot: 1,
            auction_duration: 0,
            ..Order::default()
        };
        assert!(!is_resting_limit_order(&order, 100));
    }

    #[test]
    fn expiry_requires_open_status_and_nonzero_max_ts() {
        let mut order = Order {
            status: OrderStatus::Open,
            max_ts: 100,
            ..Order::default()
        };
        assert!(!is_order_expired(&order, 99, None, None));
        assert!(is_order_expired(&order, 101, None, None));

        order.max_ts = 0;
        assert!(!is_order_expired(&order, 1_000_000, None, None));
    }
}
