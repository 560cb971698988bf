//! Generic copy-on-write B-tree engine
//!
//! The engine is written once against [`Shape`]:
//! - Height-balanced trees whose nodes are packed into single blocks
//! - Splits on byte budget, merges and refills below the fill threshold
//! - Rank and weight navigation through branch aggregates
//! - Every write runs in a transaction that publishes by swapping the root

mod cursor;
pub(crate) mod node;
mod ops;
mod shape;
mod tree;
mod txn;
mod walker;

pub use cursor::{Cursor, Entries};
pub use node::{Node, NodeLimits};
pub use shape::Shape;
pub use tree::{Duplicates, Probe, Tree, TreeStats};
pub use walker::{
    Bound, Edge, EdgeWalker, KeyWalker, RankWalker, SelectWalker, Walker, ZeroSelectWalker,
};
