//! An off-chain mirror of a perpetuals/spot exchange's on-chain limit order
//! book: ingest order state from snapshots and events, classify and index
//! it the way the matching engine would, and answer the crossing, trigger,
//! and L2/L3 book queries a keeper or indexer needs without touching the
//! chain itself (see SPEC_FULL.md).

pub mod dlob;
pub mod math;
pub mod records;
pub mod types;

pub use dlob::{BookEntry, NodeToFill, NodeToTrigger, DLOB};
pub use records::{OrderAction, OrderActionRecord, OrderActionSide, OrderRecord, UserSnapshot};
pub use types::*;
