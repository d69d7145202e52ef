pub mod dlob;
pub mod levels;
pub mod market;
pub mod node;
pub mod node_list;

pub use dlob::{BookEntry, NodeToFill, NodeToTrigger, DLOB};
pub use levels::{
    FallbackL2Generator, L2Level, L2OrderBook, L3Level, L3OrderBook, DLOB_SOURCE,
};
pub use market::{classify_order, Exchange, MarketBook, OpenOrders, Side};
pub use node::{order_key, DLOBNode, NodeType, OrderKey, OrderNode};
pub use node_list::{NodeList, SortDirection};
