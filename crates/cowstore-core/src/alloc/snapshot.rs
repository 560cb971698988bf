//! Snapshots and their container directories

use super::{Allocator, GcStats};
use crate::btree::Tree;
use crate::containers::Container;
use crate::registry::Signature;
use crate::Result;
use cowstore_blockstore::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.hyphenated())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }
    };
}

uuid_id!(
    /// Identifier of a snapshot
    SnapshotId
);

uuid_id!(
    /// Identifier of a container within snapshot directories
    ///
    /// A container keeps its id across branches, so the same id opens the
    /// parent's and the child's version.
    CtrId
);

impl CtrId {
    /// Deterministic id derived from a name
    pub fn named(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}

/// Directory entry: where a container's tree starts and what type it has
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DirEntry {
    pub root: BlockId,
    pub signature: Signature,
}

#[derive(Clone, Debug)]
pub(crate) struct SnapshotMeta {
    pub parent: Option<SnapshotId>,
    pub epoch: u64,
    pub label: Option<String>,
    pub committed: bool,
    pub directory: BTreeMap<CtrId, DirEntry>,
}

/// Public description of a snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub parent: Option<SnapshotId>,
    pub epoch: u64,
    pub label: Option<String>,
    pub committed: bool,
    /// Container ids with their signatures
    pub containers: Vec<(CtrId, String)>,
}

impl SnapshotInfo {
    pub(crate) fn from_meta(id: SnapshotId, meta: &SnapshotMeta) -> Self {
        Self {
            id,
            parent: meta.parent,
            epoch: meta.epoch,
            label: meta.label.clone(),
            committed: meta.committed,
            containers: meta
                .directory
                .iter()
                .map(|(ctr, entry)| (*ctr, entry.signature.as_str().to_string()))
                .collect(),
        }
    }
}

/// Handle to a snapshot
///
/// Mutable until committed. A committed snapshot can be branched; branches
/// share all of its blocks until they write.
#[derive(Clone)]
pub struct Snapshot {
    alloc: Arc<Allocator>,
    id: SnapshotId,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("id", &self.id).finish()
    }
}

impl Snapshot {
    pub(crate) fn new(alloc: Arc<Allocator>, id: SnapshotId) -> Self {
        Self { alloc, id }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    pub fn info(&self) -> Result<SnapshotInfo> {
        self.alloc.snapshot_info(self.id)
    }

    pub fn is_committed(&self) -> Result<bool> {
        Ok(self.info()?.committed)
    }

    /// Freeze this snapshot
    pub fn commit(&self) -> Result<()> {
        self.alloc.commit(self.id)
    }

    /// Start a mutable child of this committed snapshot
    pub fn branch(&self, label: Option<&str>) -> Result<Snapshot> {
        self.alloc.branch(self.id, label)
    }

    /// Create an empty container with a random id
    pub fn create<C: Container>(&self) -> Result<C> {
        self.create_with_id(CtrId::new())
    }

    /// Create an empty container whose id is derived from `name`
    pub fn create_named<C: Container>(&self, name: &str) -> Result<C> {
        self.create_with_id(CtrId::named(name))
    }

    pub fn create_with_id<C: Container>(&self, ctr: CtrId) -> Result<C> {
        Tree::create(self.alloc.clone(), self.id, ctr).map(C::from_tree)
    }

    /// Open an existing container, checking its type
    pub fn open<C: Container>(&self, ctr: CtrId) -> Result<C> {
        Tree::open(self.alloc.clone(), self.id, ctr).map(C::from_tree)
    }

    pub fn open_named<C: Container>(&self, name: &str) -> Result<C> {
        self.open(CtrId::named(name))
    }

    /// Remove a container from this snapshot's directory
    pub fn remove_container(&self, ctr: CtrId) -> Result<()> {
        self.alloc.remove_container(self.id, ctr)
    }

    pub fn containers(&self) -> Result<Vec<(CtrId, String)>> {
        Ok(self.info()?.containers)
    }

    /// Drop this snapshot, releasing its references
    pub fn drop_snapshot(self) -> Result<GcStats> {
        self.alloc.drop_snapshot(self.id)
    }
}
