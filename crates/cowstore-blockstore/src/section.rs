//! Persisted block section
//!
//! The block half of a store image: every written block with its allocation
//! size and encoded image.
//!
//! ```text
//! magic "CWBLKS01" | count u64 | { id [u8; 16] | size u32 | len u32 | image } * count
//! ```

use crate::{Block, BlockId, BlockStoreError, Result};
use bytes::{Buf, BufMut, Bytes};
use std::io::{Read, Write};

/// Magic bytes opening a block section
pub const SECTION_MAGIC: &[u8; 8] = b"CWBLKS01";

/// One persisted block
#[derive(Clone, Debug)]
pub struct SectionEntry {
    /// Block id
    pub id: BlockId,
    /// Allocation size of the slot
    pub size: usize,
    /// Encoded block image (header + payload)
    pub image: Bytes,
}

/// Write a block section
pub fn write_section(out: &mut dyn Write, entries: &[SectionEntry]) -> Result<()> {
    let body: usize = entries.iter().map(|e| 24 + e.image.len()).sum();
    let mut buf = Vec::with_capacity(SECTION_MAGIC.len() + 8 + body);
    buf.put_slice(SECTION_MAGIC);
    buf.put_u64_le(entries.len() as u64);
    for entry in entries {
        buf.put_slice(entry.id.as_bytes());
        buf.put_u32_le(entry.size as u32);
        buf.put_u32_le(entry.image.len() as u32);
        buf.put_slice(&entry.image);
    }
    out.write_all(&buf)?;
    Ok(())
}

/// Read a block section, verifying every block image
pub fn read_section(input: &mut dyn Read) -> Result<Vec<SectionEntry>> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let mut buf = Bytes::from(raw);

    if buf.remaining() < SECTION_MAGIC.len() + 8 || &buf[..SECTION_MAGIC.len()] != SECTION_MAGIC {
        return Err(BlockStoreError::CorruptSection("bad magic".to_string()));
    }
    buf.advance(SECTION_MAGIC.len());
    let count = buf.get_u64_le() as usize;

    let mut entries = Vec::with_capacity(count.min(1 << 16));
    for index in 0..count {
        if buf.remaining() < 24 {
            return Err(BlockStoreError::CorruptSection(format!(
                "truncated entry header at index {}",
                index
            )));
        }
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let id = BlockId::from_bytes(id);
        let size = buf.get_u32_le() as usize;
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(BlockStoreError::CorruptSection(format!(
                "truncated image for block {}",
                id
            )));
        }
        let image = buf.split_to(len);
        // Reject corrupt images up front rather than on first read.
        Block::decode(&id, &image)?;
        if len > size {
            return Err(BlockStoreError::CorruptSection(format!(
                "block {} image of {} bytes exceeds its slot of {} bytes",
                id, len, size
            )));
        }
        entries.push(SectionEntry { id, size, image });
    }

    if buf.has_remaining() {
        return Err(BlockStoreError::CorruptSection(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(entries)
}
