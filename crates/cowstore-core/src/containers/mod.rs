//! Container types built on the generic tree
//!
//! Each container is a [`Shape`] plus a thin typed front end. The common
//! surface comes from small capability traits with blanket implementations:
//! - [`Container`]: conversion from and to the underlying [`Tree`]
//! - [`Lookup`]: size and cursors
//! - [`Mutator`]: bulk clearing
//! - [`WalkerHost`]: seeking with any [`Walker`]

/// `Container` and `Debug` for a container struct holding `tree`
macro_rules! container_impl {
    ($name:ident <$($param:ident),*> => $shape:ident, where $($bounds:tt)*) => {
        impl<$($param),*> Container for $name<$($param),*>
        where
            $($bounds)*
        {
            type Shape = $shape<$($param),*>;

            fn from_tree(tree: Tree<Self::Shape>) -> Self {
                Self { tree }
            }

            fn tree(&self) -> &Tree<Self::Shape> {
                &self.tree
            }
        }

        impl<$($param),*> std::fmt::Debug for $name<$($param),*>
        where
            $($bounds)*
        {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("ctr", &self.tree.ctr())
                    .field("snapshot", &self.tree.snapshot_id())
                    .finish()
            }
        }
    };
}

mod allocmap;
mod map;
mod multimap;
mod set;
mod vector;
mod weighted;

pub use allocmap::{AllocShape, AllocationMap};
pub use map::{Map, MapShape};
pub use multimap::{Multimap, MultimapShape};
pub use set::{Set, SetShape};
pub use vector::{Vector, VectorShape};
pub use weighted::{WeightedShape, WeightedTree};

use crate::alloc::CtrId;
use crate::btree::{Cursor, Edge, EdgeWalker, Shape, Tree, Walker};
use crate::Result;
use std::ops::{Bound, RangeBounds};

/// A typed view of one container tree
pub trait Container: Sized {
    type Shape: Shape;

    fn from_tree(tree: Tree<Self::Shape>) -> Self;

    fn tree(&self) -> &Tree<Self::Shape>;

    fn id(&self) -> CtrId {
        self.tree().ctr()
    }

    /// Signature recorded in snapshot directories for this container type
    fn signature() -> String {
        <Self::Shape as Shape>::signature()
    }
}

pub trait Lookup: Container {
    fn len(&self) -> Result<u64> {
        self.tree().len()
    }

    fn is_empty(&self) -> Result<bool> {
        self.tree().is_empty()
    }

    /// Cursor on the first entry
    fn cursor(&self) -> Result<Cursor<Self::Shape>> {
        self.tree().find(EdgeWalker(Edge::First))
    }
}

impl<C: Container> Lookup for C {}

pub trait Mutator: Container {
    /// Remove every entry
    fn clear(&mut self) -> Result<()> {
        self.tree().bulk_load(Vec::new())
    }
}

impl<C: Container> Mutator for C {}

pub trait WalkerHost: Container {
    fn seek<W: Walker<Self::Shape>>(&self, walker: W) -> Result<Cursor<Self::Shape>> {
        self.tree().find(walker)
    }
}

impl<C: Container> WalkerHost for C {}

/// Positions `start..end` covered by a key range
fn key_span<S: Shape>(tree: &Tree<S>, range: &impl RangeBounds<S::Key>) -> Result<(u64, u64)> {
    use crate::btree::Bound as Side;
    let start = match range.start_bound() {
        Bound::Included(key) => tree.rank_of_key(key, Side::Lower)?,
        Bound::Excluded(key) => tree.rank_of_key(key, Side::Upper)?,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(key) => tree.rank_of_key(key, Side::Upper)?,
        Bound::Excluded(key) => tree.rank_of_key(key, Side::Lower)?,
        Bound::Unbounded => tree.len()?,
    };
    Ok((start, end.max(start)))
}
