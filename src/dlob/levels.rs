//! L2/L3 order-book projection: price-level aggregation over the resting
//! book, merged against external fallback liquidity streams.

use std::collections::BTreeSet;

use crate::dlob::node::DLOBNode;
use crate::dlob::node_list::NodeList;
use crate::types::{OraclePriceData, UserAccount};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Level {
    pub price: i128,
    pub size: u64,
    pub sources: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct L2OrderBook {
    pub asks: Vec<L2Level>,
    pub bids: Vec<L2Level>,
    pub slot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Level {
    pub price: i128,
    pub size: u64,
    pub maker: UserAccount,
    pub order_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct L3OrderBook {
    pub asks: Vec<L3Level>,
    pub bids: Vec<L3Level>,
    pub slot: u64,
}

/// External fallback liquidity (AMM, cross-venue) projected as L2 levels.
pub trait FallbackL2Generator {
    fn l2_asks(&mut self) -> Vec<L2Level>;
    fn l2_bids(&mut self) -> Vec<L2Level>;
}

pub const DLOB_SOURCE: &str = "dlob";

/// Project a price-sorted `NodeList` (or any iterator of resting-limit
/// nodes) into L2 levels tagged as DLOB-sourced liquidity.
pub fn l2_levels_from_nodes<'a>(
    nodes: impl Iterator<Item = &'a crate::dlob::node::OrderNode>,
    oracle_price_data: &OraclePriceData,
    slot: u64,
) -> Vec<L2Level> {
    nodes
        .filter(|node| !node.is_base_filled())
        .filter_map(|node| {
            let price = node.effective_price(oracle_price_data, slot)?;
            Some(L2Level {
                price,
                size: node.order.base_asset_amount_remaining(),
                sources: BTreeSet::from([DLOB_SOURCE.to_string()]),
            })
        })
        .collect()
}

/// Merge already-sorted level streams (best first, per `better`), collapse
/// consecutive same-price levels by summing size and unioning sources, and
/// take the first `depth`.
pub fn merge_levels(
    mut streams: Vec<Vec<L2Level>>,
    better: impl Fn(&L2Level, &L2Level) -> bool,
    depth: usize,
) -> Vec<L2Level> {
    let mut cursors = vec![0usize; streams.len()];
    let mut merged: Vec<L2Level> = Vec::new();

    loop {
        let mut best_stream: Option<usize> = None;
        for (i, stream) in streams.iter().enumerate() {
            if cursors[i] >= stream.len() {
                continue;
            }
            match best_stream {
                None => best_stream = Some(i),
                Some(b) => {
                    if better(&stream[cursors[i]], &streams[b][cursors[b]]) {
                        best_stream = Some(i);
                    }
                }
            }
        }

        let Some(i) = best_stream else { break };
        let level = streams[i][cursors[i]].clone();
        cursors[i] += 1;

        match merged.last_mut() {
            Some(last) if last.price == level.price => {
                last.size += level.size;
                last.sources.extend(level.sources);
            }
            _ => merged.push(level),
        }
    }

    streams.clear();
    merged.truncate(depth);
    merged
}

pub fn l2_asks_from_list(list: &NodeList, oracle_price_data: &OraclePriceData, slot: u64) -> Vec<L2Level> {
    l2_levels_from_nodes(list.iter(), oracle_price_data, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: i128, size: u64) -> L2Level {
        L2Level {
            price,
            size,
            sources: BTreeSet::from([DLOB_SOURCE.to_string()]),
        }
    }

    #[test]
    fn merge_collapses_same_price_levels() {
        let a = vec![level(100, 1), level(101, 4)];
        let b = vec![level(100, 2)];
        let merged = merge_levels(vec![a, b], |x, y| x.price < y.price, 10);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].price, 100);
        assert_eq!(merged[0].size, 3);
        assert_eq!(merged[1].price, 101);
        assert_eq!(merged[1].size, 4);
    }

    #[test]
    fn merge_respects_depth() {
        let a = vec![level(100, 1), level(101, 2), level(102, 3)];
        let merged = merge_levels(vec![a], |x, y| x.price < y.price, 2);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn depth_one_still_collapses_a_same_price_second_stream() {
        let a = vec![level(100, 1)];
        let b = vec![level(100, 2)];
        let merged = merge_levels(vec![a, b], |x, y| x.price < y.price, 1);
        assert_eq!(merged, vec![level(100, 3)]);
    }
}
