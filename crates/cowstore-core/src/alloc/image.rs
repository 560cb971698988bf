//! Persisted engine images
//!
//! Layout:
//!
//! ```text
//! magic "CWSIMG01" | version u32 | manifest_len u64 | manifest (DAG-CBOR)
//!   | block section | BLAKE3 of everything before it (32 bytes)
//! ```
//!
//! The manifest lists snapshots and their directories. Reference counts are
//! not stored; loading recomputes them from branch payloads and directory
//! roots, so blocks that were only pinned come back as garbage.

use super::{AllocState, Allocator, BlockMeta, CtrId, DirEntry, SnapshotId, SnapshotMeta};
use crate::config::EngineConfig;
use crate::packed::branch;
use crate::registry::TypeRegistry;
use crate::{CoreError, Result};
use bytes::{Buf, BufMut};
use cowstore_blockstore::{BlockId, BlockKind, BlockStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const IMAGE_MAGIC: &[u8; 8] = b"CWSIMG01";
pub const IMAGE_VERSION: u32 = 1;

const PREAMBLE_LEN: usize = 8 + 4 + 8;
const TRAILER_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    block_size: u64,
    next_epoch: u64,
    snapshots: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    id: SnapshotId,
    parent: Option<SnapshotId>,
    epoch: u64,
    label: Option<String>,
    committed: bool,
    containers: Vec<ContainerRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContainerRecord {
    id: CtrId,
    root: BlockId,
    signature: String,
}

impl Allocator {
    /// Write every snapshot and live block to `path`
    ///
    /// The image goes to a temporary file next to `path` that is renamed
    /// into place once complete.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn store_image(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut body = Vec::new();
        {
            let state = self.state.read();
            let manifest = Manifest {
                block_size: self.config.block_size as u64,
                next_epoch: state.next_epoch,
                snapshots: state
                    .snapshots
                    .iter()
                    .map(|(id, meta)| SnapshotRecord {
                        id: *id,
                        parent: meta.parent,
                        epoch: meta.epoch,
                        label: meta.label.clone(),
                        committed: meta.committed,
                        containers: meta
                            .directory
                            .iter()
                            .map(|(ctr, entry)| ContainerRecord {
                                id: *ctr,
                                root: entry.root,
                                signature: entry.signature.as_str().to_string(),
                            })
                            .collect(),
                    })
                    .collect(),
            };
            let encoded = serde_ipld_dagcbor::to_vec(&manifest)
                .map_err(|e| CoreError::Serialization(e.to_string()))?;

            body.put_slice(IMAGE_MAGIC);
            body.put_u32_le(IMAGE_VERSION);
            body.put_u64_le(encoded.len() as u64);
            body.put_slice(&encoded);
            self.store.persist(&mut body)?;
        }
        let digest = blake3::hash(&body);
        body.put_slice(digest.as_bytes());

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        info!(bytes = body.len(), "stored image");
        Ok(())
    }

    /// Load an image into a fresh default store built from `config`
    pub fn load_image(
        path: impl AsRef<Path>,
        config: EngineConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Arc<Self>> {
        let store = Self::default_store(&config);
        Self::load_image_into(path, store, config, registry)
    }

    /// Load an image into `store`, which should be empty
    ///
    /// Every container signature in the image must already be registered.
    #[instrument(skip(path, store, config, registry), fields(path = %path.as_ref().display()))]
    pub fn load_image_into(
        path: impl AsRef<Path>,
        store: Arc<dyn BlockStore>,
        mut config: EngineConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Arc<Self>> {
        let data = fs::read(path.as_ref())?;
        if data.len() < PREAMBLE_LEN + TRAILER_LEN {
            return Err(CoreError::CorruptImage(format!(
                "image of {} bytes is too short",
                data.len()
            )));
        }
        let (body, trailer) = data.split_at(data.len() - TRAILER_LEN);
        if blake3::hash(body).as_bytes() != trailer {
            return Err(CoreError::CorruptImage("checksum mismatch".to_string()));
        }

        let mut input = body;
        if &input[..8] != IMAGE_MAGIC {
            return Err(CoreError::CorruptImage("bad magic".to_string()));
        }
        input.advance(8);
        let version = input.get_u32_le();
        if version != IMAGE_VERSION {
            return Err(CoreError::CorruptImage(format!(
                "unsupported image version {}",
                version
            )));
        }
        let manifest_len = input.get_u64_le() as usize;
        if manifest_len > input.len() {
            return Err(CoreError::CorruptImage("truncated manifest".to_string()));
        }
        let (encoded, mut section) = input.split_at(manifest_len);
        let manifest: Manifest = serde_ipld_dagcbor::from_slice(encoded)?;

        if manifest.block_size as usize != config.block_size {
            warn!(
                image = manifest.block_size,
                configured = config.block_size,
                "using the image's block size"
            );
            config.block_size = manifest.block_size as usize;
        }
        config.validate()?;

        store.load(&mut section)?;
        let state = rebuild_state(store.as_ref(), &registry, manifest)?;
        info!(
            snapshots = state.snapshots.len(),
            blocks = state.blocks.len(),
            garbage = state.pending.len(),
            "loaded image"
        );
        Ok(Arc::new(Self::from_parts(store, config, registry, state)))
    }
}

/// Recompute bookkeeping from the loaded blocks and the manifest
fn rebuild_state(
    store: &dyn BlockStore,
    registry: &TypeRegistry,
    manifest: Manifest,
) -> Result<AllocState> {
    let mut state = AllocState {
        next_epoch: manifest.next_epoch,
        ..AllocState::default()
    };
    let mut children = Vec::new();
    for id in store.block_ids() {
        let block = store.read(&id)?;
        if block.header.kind == BlockKind::Branch {
            let ids = branch::child_ids(&block.payload)
                .map_err(|e| CoreError::corrupt(id, e.to_string()))?;
            children.extend(ids);
        }
        state.blocks.insert(
            id,
            BlockMeta {
                refs: 0,
                epoch: block.header.epoch,
            },
        );
    }
    for child in &children {
        state.incref(child).map_err(|_| {
            CoreError::CorruptImage(format!("branch references missing block {}", child))
        })?;
    }

    for record in manifest.snapshots {
        let mut directory = BTreeMap::new();
        for container in record.containers {
            let signature = registry.require(&container.signature)?;
            state.incref(&container.root).map_err(|_| {
                CoreError::CorruptImage(format!(
                    "container {} has missing root {}",
                    container.id, container.root
                ))
            })?;
            directory.insert(
                container.id,
                DirEntry {
                    root: container.root,
                    signature,
                },
            );
        }
        state.next_epoch = state.next_epoch.max(record.epoch);
        state.snapshots.insert(
            record.id,
            SnapshotMeta {
                parent: record.parent,
                epoch: record.epoch,
                label: record.label,
                committed: record.committed,
                directory,
            },
        );
    }

    state.pending = state
        .blocks
        .iter()
        .filter(|(_, meta)| meta.refs == 0)
        .map(|(id, _)| *id)
        .collect();
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{Lookup, Map};
    use tempfile::TempDir;

    #[test]
    fn test_image_rejects_tampering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.img");

        let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
        let snap = alloc.create_snapshot(Some("main"));
        let mut map: Map<u64, String> = snap.create_named("names").unwrap();
        map.insert(1, "one".to_string()).unwrap();
        snap.commit().unwrap();
        alloc.store_image(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        let registry = Arc::new(TypeRegistry::with_builtin());
        assert!(matches!(
            Allocator::load_image(&path, EngineConfig::default(), registry),
            Err(CoreError::CorruptImage(_))
        ));
    }

    #[test]
    fn test_image_requires_registered_signatures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.img");

        let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
        let snap = alloc.create_snapshot(None);
        let _: Map<u64, String> = snap.create_named("names").unwrap();
        alloc.store_image(&path).unwrap();

        let empty = Arc::new(TypeRegistry::new());
        assert!(matches!(
            Allocator::load_image(&path, EngineConfig::default(), empty),
            Err(CoreError::UnknownSignature(_))
        ));

        let registry = Arc::new(TypeRegistry::with_builtin());
        let loaded = Allocator::load_image(&path, EngineConfig::default(), registry).unwrap();
        let snap = loaded.snapshot(snap.id()).unwrap();
        let map: Map<u64, String> = snap.open_named("names").unwrap();
        assert!(map.is_empty().unwrap());
    }
}
