//! Domain types for the off-chain order book: orders, markets, oracle
//! prices, and the crate's error type.
//!
//! These mirror the shapes the on-chain program exposes, without depending
//! on the program crate itself — the DLOB treats markets, orders and oracle
//! data as externally supplied, typed values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DlobResult<T> = Result<T, DlobError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DlobError {
    #[error("DLOB already initialized")]
    AlreadyInitialized,
    #[error("oracle price data required for spot resting-limit query")]
    MissingOracle,
}

/// Opaque 32-byte account identifier. Value semantics: copied, never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserAccount(pub [u8; 32]);

impl UserAccount {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for UserAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Perp,
    Spot,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Perp => "perp",
            MarketType::Spot => "spot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    TriggerMarket,
    TriggerLimit,
    Oracle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Init,
    Open,
    Filled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderTriggerCondition {
    Above,
    Below,
    TriggeredAbove,
    TriggeredBelow,
}

/// A single open order. Identity is `(order_id, user_account)`. Immutable
/// per update: the DLOB never mutates a live `Order` in place, it replaces
/// it wholesale via `update_order`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u32,
    pub market_type: MarketType,
    pub market_index: u16,
    pub direction: PositionDirection,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub base_asset_amount: u64,
    pub base_asset_amount_filled: u64,
    pub price: u64,
    pub oracle_price_offset: i32,
    pub auction_start_price: i64,
    pub auction_end_price: i64,
    pub auction_duration: u8,
    pub slot: u64,
    pub trigger_price: u64,
    pub trigger_condition: OrderTriggerCondition,
    pub post_only: bool,
    pub max_ts: i64,
    pub reduce_only: bool,
    pub immediate_or_cancel: bool,
}

impl Order {
    pub fn base_asset_amount_remaining(&self) -> u64 {
        self.base_asset_amount - self.base_asset_amount_filled
    }

    pub fn is_base_filled(&self) -> bool {
        self.base_asset_amount_filled == self.base_asset_amount
    }

    pub fn is_limit_order(&self) -> bool {
        matches!(self.order_type, OrderType::Limit | OrderType::TriggerLimit)
    }
}

impl Default for Order {
    fn default() -> Self {
        Self {
            order_id: 0,
            market_type: MarketType::Perp,
            market_index: 0,
            direction: PositionDirection::Long,
            order_type: OrderType::Limit,
            status: OrderStatus::Open,
            base_asset_amount: 0,
            base_asset_amount_filled: 0,
            price: 0,
            oracle_price_offset: 0,
            auction_start_price: 0,
            auction_end_price: 0,
            auction_duration: 0,
            slot: 0,
            trigger_price: 0,
            trigger_condition: OrderTriggerCondition::Above,
            post_only: false,
            max_ts: 0,
            reduce_only: false,
            immediate_or_cancel: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OraclePriceData {
    pub price: i64,
    pub confidence: u64,
    pub has_sufficient_number_of_data_points: bool,
}

/// Exchange-wide pause flags and the fee tiers `find_nodes_to_fill` reads
/// to compute the maker-rebate buffer on fallback crossings (see
/// SPEC_FULL.md §10). Bit layout mirrors the on-chain `ExchangeStatus`
/// bitflags: bit 0 = fill paused, bit 1 = amm paused, bit 2 = exchange
/// paused, zero = active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct State {
    pub exchange_status: u8,
    pub min_perp_auction_duration: u8,
    pub perp_maker_rebate_numerator: u32,
    pub perp_maker_rebate_denominator: u32,
    pub spot_maker_rebate_numerator: u32,
    pub spot_maker_rebate_denominator: u32,
}

pub const EXCHANGE_STATUS_ACTIVE: u8 = 0;
pub const EXCHANGE_STATUS_FILL_PAUSED: u8 = 1 << 0;
pub const EXCHANGE_STATUS_AMM_PAUSED: u8 = 1 << 1;
pub const EXCHANGE_STATUS_PAUSED: u8 = 1 << 2;

impl State {
    pub fn maker_rebate(&self, market_type: MarketType) -> (u32, u32) {
        match market_type {
            MarketType::Perp => (
                self.perp_maker_rebate_numerator,
                self.perp_maker_rebate_denominator,
            ),
            MarketType::Spot => (
                self.spot_maker_rebate_numerator,
                self.spot_maker_rebate_denominator,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerpMarket {
    pub market_index: u16,
    pub paused_operations: u8,
    pub fee_adjustment: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpotMarket {
    pub market_index: u16,
    pub paused_operations: u8,
}

pub const PERP_OPERATION_FILL: u8 = 1 << 0;
pub const SPOT_OPERATION_FILL: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketAccount {
    Perp(PerpMarket),
    Spot(SpotMarket),
}

impl MarketAccount {
    pub fn market_index(&self) -> u16 {
        match self {
            MarketAccount::Perp(m) => m.market_index,
            MarketAccount::Spot(m) => m.market_index,
        }
    }
}
