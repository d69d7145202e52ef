//! Auction window helpers: linear interpolation of the order's limit price
//! over its auction window, and the "has the auction finished" predicate
//! both `math::order` and `dlob::dlob` branch on.

use crate::types::Order;

/// True once `slot` is past `order.slot + order.auction_duration`.
pub fn is_auction_complete(order: &Order, slot: u64) -> bool {
    if order.auction_duration == 0 {
        return true;
    }
    slot > order.slot + order.auction_duration as u64
}

/// Linear interpolation between `auction_start_price` and
/// `auction_end_price` over `auction_duration` slots. Clamped to the
/// endpoints outside the window.
pub fn get_auction_price(order: &Order, slot: u64, oracle_price: i64) -> i64 {
    if order.auction_start_price == 0 && order.auction_end_price == 0 {
        return oracle_price;
    }
    if is_auction_complete(order, slot) {
        return order.auction_end_price;
    }
    if slot <= order.slot {
        return order.auction_start_price;
    }

    let elapsed = slot - order.slot;
    let duration = order.auction_duration as u64;
    let delta = order.auction_end_price - order.auction_start_price;

    order.auction_start_price + (delta * elapsed as i64) / duration as i64
}

/// True when a taking order's auction has run long enough that a fallback
/// liquidity source (AMM, cross-venue) may legitimately fill it.
pub fn is_fallback_available_liquidity_source(
    order: &Order,
    min_auction_duration: u8,
    slot: u64,
) -> bool {
    if order.auction_duration == 0 {
        return true;
    }
    let elapsed_since_submission = slot.saturating_sub(order.slot);
    elapsed_since_submission >= min_auction_duration.max(order.auction_duration) as u64
        || is_auction_complete(order, slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Order;

    #[test]
    fn auction_price_interpolates_linearly() {
        let order = Order {
            slot: 10,
            auction_duration: 10,
            auction_start_price: 100,
            auction_end_price: 200,
            ..Order::default()
        };
        assert_eq!(get_auction_price(&order, 10, 0), 100);
        assert_eq!(get_auction_price(&order, 15, 0), 150);
        assert_eq!(get_auction_price(&order, 20, 0), 200);
    }

    #[test]
    fn auction_completes_after_duration() {
        let order = Order {
            slot: 10,
            auction_duration: 5,
            ..Order::default()
        };
        assert!(!is_auction_complete(&order, 14));
        assert!(!is_auction_complete(&order, 15));
        assert!(is_auction_complete(&order, 16));
    }

    #[test]
    fn zero_duration_auction_is_always_complete() {
        let order = Order {
            slot: 10,
            auction_duration: 0,
            ..Order::default()
        };
        assert!(is_auction_complete(&order, 10));
    }
}
