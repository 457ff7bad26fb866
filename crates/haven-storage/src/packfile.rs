//! Pack file reading: entry decoding, delta resolution, and pack indices.
//!
//! Packs are read-only here; building packs lives in the sync engine. A pack
//! may arrive with a co-located `.idx` file, otherwise the index is rebuilt
//! by scanning the pack body.

use crate::{ObjectId, ObjectType, Result, StorageError, VaultObject};
use flate2::read::ZlibDecoder;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Read;

/// Magic bytes at the start of a pack file.
pub(crate) const PACK_MAGIC: &[u8; 4] = b"PACK";
/// Pack file version we support.
pub(crate) const PACK_VERSION: u32 = 2;
/// Magic bytes at the start of a v2 pack index.
pub const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];

const OFS_DELTA: u8 = 6;
const REF_DELTA: u8 = 7;

/// Capability for resolving a delta base that lives outside the pack being
/// read. The object store implements this; tests can substitute stubs.
pub trait ExternalBaseResolver {
    /// Resolves an object id outside the current pack.
    fn resolve_base(&self, oid: &ObjectId) -> Result<VaultObject>;
}

/// Resolver for scan rounds that must not leave the pack: a missing base
/// is reported as not-found so the caller can retry once more offsets are
/// known.
struct InPackOnly;

impl ExternalBaseResolver for InPackOnly {
    fn resolve_base(&self, oid: &ObjectId) -> Result<VaultObject> {
        Err(StorageError::ObjectNotFound(oid.to_hex()))
    }
}

/// One pack index record.
#[derive(Debug, Clone, Copy)]
struct IdxEntry {
    offset: u64,
    crc: u32,
}

/// Mapping from oid to byte offset (and CRC) within one pack.
#[derive(Debug, Clone)]
pub struct PackIndex {
    entries: HashMap<ObjectId, IdxEntry>,
    /// Trailing SHA-1 of the indexed pack.
    pack_checksum: [u8; 20],
}

impl PackIndex {
    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the pack contains the object.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.entries.contains_key(oid)
    }

    /// Byte offset of the object within the pack, if present.
    pub fn offset_of(&self, oid: &ObjectId) -> Option<u64> {
        self.entries.get(oid).map(|e| e.offset)
    }

    /// All indexed oids.
    pub fn oids(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries.keys()
    }

    /// Builds an index by scanning a whole pack, verifying the trailer
    /// checksum first. A ref-delta may name a base anywhere in the pack,
    /// including later entries; only bases absent from the pack altogether
    /// go through `external`.
    pub fn scan(data: &[u8], external: &dyn ExternalBaseResolver) -> Result<Self> {
        let count = verify_pack_header(data)?;
        let pack_checksum = verify_pack_trailer(data)?;

        let mut offsets: HashMap<ObjectId, u64> = HashMap::with_capacity(count);
        let mut entries = HashMap::with_capacity(count);

        // First pass: walk every entry. Whole objects get their ids now;
        // deltas wait until the offset map covers the full pack.
        let mut pending: Vec<(u64, u32)> = Vec::new();
        let mut pos = 12usize;
        for _ in 0..count {
            let offset = pos as u64;
            let header = parse_entry_header(data, pos)?;
            let (body, consumed) = inflate_entry(data, header.body_start, header.size)?;
            let end = header.body_start + consumed;
            let crc = crc32(&data[pos..end]);
            if matches!(header.kind_code, 1..=4) {
                let object =
                    VaultObject::new(ObjectType::from_pack_type(header.kind_code)?, body);
                offsets.insert(object.id, offset);
                entries.insert(object.id, IdxEntry { offset, crc });
            } else {
                pending.push((offset, crc));
            }
            pos = end;
        }
        if pos != data.len() - 20 {
            return Err(StorageError::Corruption(
                "pack has trailing garbage before checksum".into(),
            ));
        }

        // Second pass: resolve deltas in rounds. Each round either settles
        // at least one entry against in-pack bases, or falls back to the
        // external resolver for what remains; a round with no progress at
        // all surfaces the failure.
        while !pending.is_empty() {
            let mut unresolved = Vec::with_capacity(pending.len());
            for &(offset, crc) in &pending {
                match decode_at(data, offset, &offsets, &InPackOnly) {
                    Ok(object) => {
                        offsets.insert(object.id, offset);
                        entries.insert(object.id, IdxEntry { offset, crc });
                    }
                    Err(StorageError::ObjectNotFound(_)) => unresolved.push((offset, crc)),
                    Err(e) => return Err(e),
                }
            }
            if unresolved.len() == pending.len() {
                let mut still = Vec::with_capacity(unresolved.len());
                let mut first_err = None;
                for &(offset, crc) in &unresolved {
                    match decode_at(data, offset, &offsets, external) {
                        Ok(object) => {
                            offsets.insert(object.id, offset);
                            entries.insert(object.id, IdxEntry { offset, crc });
                        }
                        Err(e) => {
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                            still.push((offset, crc));
                        }
                    }
                }
                if still.len() == unresolved.len() {
                    return Err(first_err.expect("stalled round has at least one entry"));
                }
                unresolved = still;
            }
            pending = unresolved;
        }

        Ok(Self {
            entries,
            pack_checksum,
        })
    }

    /// Parses a v2 `.idx` file, verifying its own trailing checksum.
    pub fn from_idx_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 8 + 256 * 4 + 40 {
            return Err(StorageError::Corruption("pack index too small".into()));
        }
        if data[0..4] != IDX_MAGIC {
            return Err(StorageError::Corruption("bad pack index magic".into()));
        }
        let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
        if version != 2 {
            return Err(StorageError::Corruption(format!(
                "unsupported pack index version: {}",
                version
            )));
        }

        // The index carries a SHA-1 of its own preceding bytes.
        let own_checksum_start = data.len() - 20;
        let digest = Sha1::digest(&data[..own_checksum_start]);
        if digest.as_slice() != &data[own_checksum_start..] {
            return Err(StorageError::Corruption("pack index checksum mismatch".into()));
        }

        let fanout_end = 8 + 256 * 4;
        let count = u32::from_be_bytes(data[fanout_end - 4..fanout_end].try_into().unwrap()) as usize;

        let oids_end = fanout_end + count * 20;
        let crcs_end = oids_end + count * 4;
        let offsets_end = crcs_end + count * 4;
        if data.len() != offsets_end + 40 {
            return Err(StorageError::Corruption("pack index size mismatch".into()));
        }

        let mut entries = HashMap::with_capacity(count);
        for i in 0..count {
            let oid_start = fanout_end + i * 20;
            let mut oid = [0u8; 20];
            oid.copy_from_slice(&data[oid_start..oid_start + 20]);
            let crc_start = oids_end + i * 4;
            let crc = u32::from_be_bytes(data[crc_start..crc_start + 4].try_into().unwrap());
            let off_start = crcs_end + i * 4;
            let offset = u32::from_be_bytes(data[off_start..off_start + 4].try_into().unwrap());
            if offset & 0x8000_0000 != 0 {
                return Err(StorageError::Corruption(
                    "64-bit pack offsets are not supported".into(),
                ));
            }
            entries.insert(
                ObjectId::from_bytes(oid),
                IdxEntry {
                    offset: offset as u64,
                    crc,
                },
            );
        }

        let mut pack_checksum = [0u8; 20];
        pack_checksum.copy_from_slice(&data[offsets_end..offsets_end + 20]);

        Ok(Self {
            entries,
            pack_checksum,
        })
    }

    /// Serializes the index to v2 `.idx` bytes (the lazily-written cache
    /// side effect of a scan).
    pub fn to_idx_bytes(&self) -> Vec<u8> {
        let mut sorted: Vec<(&ObjectId, &IdxEntry)> = self.entries.iter().collect();
        sorted.sort_by_key(|(oid, _)| **oid);

        let mut out = Vec::with_capacity(8 + 256 * 4 + sorted.len() * 28 + 40);
        out.extend_from_slice(&IDX_MAGIC);
        out.extend_from_slice(&2u32.to_be_bytes());

        let mut fanout = [0u32; 256];
        for (oid, _) in &sorted {
            fanout[oid.as_bytes()[0] as usize] += 1;
        }
        let mut running = 0u32;
        for bucket in fanout.iter_mut() {
            running += *bucket;
            *bucket = running;
        }
        for bucket in fanout {
            out.extend_from_slice(&bucket.to_be_bytes());
        }

        for (oid, _) in &sorted {
            out.extend_from_slice(oid.as_bytes());
        }
        for (_, entry) in &sorted {
            out.extend_from_slice(&entry.crc.to_be_bytes());
        }
        for (_, entry) in &sorted {
            out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        }

        out.extend_from_slice(&self.pack_checksum);
        let digest = Sha1::digest(&out);
        out.extend_from_slice(&digest);
        out
    }
}

/// A pack whose body is memory-resident, together with its index.
#[derive(Debug)]
pub struct LoadedPack {
    data: Vec<u8>,
    index: PackIndex,
}

impl LoadedPack {
    /// Wraps already-verified pack bytes with a pre-built index.
    pub fn new(data: Vec<u8>, index: PackIndex) -> Self {
        Self { data, index }
    }

    /// Loads a pack, building its index by scanning.
    pub fn load(data: Vec<u8>, external: &dyn ExternalBaseResolver) -> Result<Self> {
        let index = PackIndex::scan(&data, external)?;
        Ok(Self { data, index })
    }

    /// The pack's index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Raw pack bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the pack contains the object.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.index.contains(oid)
    }

    /// Extracts an object, resolving any delta chain.
    pub fn read_object(
        &self,
        oid: &ObjectId,
        external: &dyn ExternalBaseResolver,
    ) -> Result<VaultObject> {
        let offset = self
            .index
            .offset_of(oid)
            .ok_or_else(|| StorageError::ObjectNotFound(oid.to_hex()))?;
        let offsets: HashMap<ObjectId, u64> = self
            .index
            .entries
            .iter()
            .map(|(k, v)| (*k, v.offset))
            .collect();
        decode_at(&self.data, offset, &offsets, external)
    }
}

/// Verifies the 12-byte pack header and returns the object count.
pub(crate) fn verify_pack_header(data: &[u8]) -> Result<usize> {
    if data.len() < 32 {
        return Err(StorageError::Corruption("pack too small".into()));
    }
    if &data[0..4] != PACK_MAGIC {
        return Err(StorageError::Corruption("bad pack magic".into()));
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if version != PACK_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported pack version: {}",
            version
        )));
    }
    Ok(u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize)
}

/// Verifies the trailing SHA-1 and returns it.
pub(crate) fn verify_pack_trailer(data: &[u8]) -> Result<[u8; 20]> {
    if data.len() < 20 {
        return Err(StorageError::Corruption("pack too small".into()));
    }
    let checksum_start = data.len() - 20;
    let digest = Sha1::digest(&data[..checksum_start]);
    if digest.as_slice() != &data[checksum_start..] {
        return Err(StorageError::Corruption("pack checksum mismatch".into()));
    }
    let mut trailer = [0u8; 20];
    trailer.copy_from_slice(&data[checksum_start..]);
    Ok(trailer)
}

/// A parsed entry header.
struct EntryHeader {
    kind_code: u8,
    size: usize,
    /// Absolute offset of an ofs-delta base.
    base_offset: Option<u64>,
    /// Base oid of a ref-delta.
    base_oid: Option<ObjectId>,
    /// Offset of the zlib body.
    body_start: usize,
}

fn parse_entry_header(data: &[u8], offset: usize) -> Result<EntryHeader> {
    let limit = data.len().saturating_sub(20);
    let mut pos = offset;
    if pos >= limit {
        return Err(StorageError::Corruption("pack entry past end".into()));
    }

    let first = data[pos];
    pos += 1;
    let kind_code = (first >> 4) & 0x07;
    let mut size = (first & 0x0F) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        if pos >= limit {
            return Err(StorageError::Corruption("truncated entry size".into()));
        }
        byte = data[pos];
        pos += 1;
        size |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
    }

    let mut base_offset = None;
    let mut base_oid = None;
    match kind_code {
        OFS_DELTA => {
            // Distance back to the base, in git's offset encoding.
            if pos >= limit {
                return Err(StorageError::Corruption("truncated ofs-delta base".into()));
            }
            let mut b = data[pos];
            pos += 1;
            let mut dist = (b & 0x7F) as u64;
            while b & 0x80 != 0 {
                if pos >= limit {
                    return Err(StorageError::Corruption("truncated ofs-delta base".into()));
                }
                b = data[pos];
                pos += 1;
                dist = ((dist + 1) << 7) | (b & 0x7F) as u64;
            }
            let abs = (offset as u64).checked_sub(dist).ok_or_else(|| {
                StorageError::Corruption("ofs-delta base before pack start".into())
            })?;
            base_offset = Some(abs);
        }
        REF_DELTA => {
            if pos + 20 > limit {
                return Err(StorageError::Corruption("truncated ref-delta base".into()));
            }
            let mut oid = [0u8; 20];
            oid.copy_from_slice(&data[pos..pos + 20]);
            pos += 20;
            base_oid = Some(ObjectId::from_bytes(oid));
        }
        1..=4 => {}
        other => {
            return Err(StorageError::Corruption(format!(
                "unknown pack type code: {}",
                other
            )));
        }
    }

    Ok(EntryHeader {
        kind_code,
        size,
        base_offset,
        base_oid,
        body_start: pos,
    })
}

/// Inflates an entry body of a declared size, returning the bytes and the
/// number of compressed bytes consumed.
fn inflate_entry(data: &[u8], body_start: usize, size: usize) -> Result<(Vec<u8>, usize)> {
    let limit = data.len().saturating_sub(20);
    let mut decoder = ZlibDecoder::new(&data[body_start..limit]);
    let mut out = vec![0u8; size];
    decoder
        .read_exact(&mut out)
        .map_err(|e| StorageError::Corruption(format!("entry decompression failed: {}", e)))?;
    // Drive the stream to its end so total_in covers the zlib trailer.
    let mut sink = [0u8; 1];
    let extra = decoder
        .read(&mut sink)
        .map_err(|e| StorageError::Corruption(format!("entry decompression failed: {}", e)))?;
    if extra != 0 {
        return Err(StorageError::Corruption(
            "entry larger than declared size".into(),
        ));
    }
    Ok((out, decoder.total_in() as usize))
}

/// Decodes the object at `offset`, resolving any delta chain with an
/// explicit work list so pathological chains cannot blow the stack.
fn decode_at(
    data: &[u8],
    offset: u64,
    offsets: &HashMap<ObjectId, u64>,
    external: &dyn ExternalBaseResolver,
) -> Result<VaultObject> {
    let mut deltas: Vec<Vec<u8>> = Vec::new();
    let mut cursor = offset;
    let (kind, mut content) = loop {
        let header = parse_entry_header(data, cursor as usize)?;
        let (body, _) = inflate_entry(data, header.body_start, header.size)?;
        match header.kind_code {
            1..=4 => {
                break (ObjectType::from_pack_type(header.kind_code)?, body);
            }
            OFS_DELTA => {
                deltas.push(body);
                cursor = header.base_offset.expect("ofs-delta carries an offset");
            }
            REF_DELTA => {
                let base_oid = header.base_oid.expect("ref-delta carries an oid");
                deltas.push(body);
                match offsets.get(&base_oid) {
                    Some(base_offset) => cursor = *base_offset,
                    None => {
                        let base = external.resolve_base(&base_oid)?;
                        break (base.kind, base.data.to_vec());
                    }
                }
            }
            _ => unreachable!("parse_entry_header rejects unknown codes"),
        }
    };

    while let Some(delta) = deltas.pop() {
        content = apply_delta(&content, &delta)?;
    }
    Ok(VaultObject::new(kind, content))
}

/// Applies a git delta (copy/insert opcode stream) to a base object.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let source_size = read_delta_size(delta, &mut pos)?;
    if source_size != base.len() {
        return Err(StorageError::Corruption(format!(
            "delta source size {} does not match base {}",
            source_size,
            base.len()
        )));
    }
    let target_size = read_delta_size(delta, &mut pos)?;

    let mut out = Vec::with_capacity(target_size);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            // Copy from base: optional little-endian offset/size bytes.
            let mut offset = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    let b = *delta
                        .get(pos)
                        .ok_or_else(|| StorageError::Corruption("truncated delta copy".into()))?;
                    pos += 1;
                    offset |= (b as usize) << (8 * i);
                }
            }
            let mut size = 0usize;
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    let b = *delta
                        .get(pos)
                        .ok_or_else(|| StorageError::Corruption("truncated delta copy".into()))?;
                    pos += 1;
                    size |= (b as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| StorageError::Corruption("delta copy out of range".into()))?;
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            // Insert literal bytes.
            let len = cmd as usize;
            let chunk = delta
                .get(pos..pos + len)
                .ok_or_else(|| StorageError::Corruption("truncated delta insert".into()))?;
            out.extend_from_slice(chunk);
            pos += len;
        } else {
            return Err(StorageError::Corruption("zero delta opcode".into()));
        }
    }

    if out.len() != target_size {
        return Err(StorageError::Corruption(format!(
            "delta produced {} bytes, declared {}",
            out.len(),
            target_size
        )));
    }
    Ok(out)
}

fn read_delta_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let b = *delta
            .get(*pos)
            .ok_or_else(|| StorageError::Corruption("truncated delta size".into()))?;
        *pos += 1;
        size |= ((b & 0x7F) as usize) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok(size);
        }
    }
}

/// CRC-32 over an entry's raw (compressed) bytes.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: arbitrary bytes never panic the scanner.
        #[test]
        fn prop_scan_no_panic(data in prop::collection::vec(any::<u8>(), 0..600)) {
            struct None_;
            impl ExternalBaseResolver for None_ {
                fn resolve_base(&self, oid: &ObjectId) -> crate::Result<VaultObject> {
                    Err(StorageError::ObjectNotFound(oid.to_hex()))
                }
            }
            let _ = PackIndex::scan(&data, &None_);
        }

        /// Property: a delta of pure inserts reconstructs its literal bytes.
        #[test]
        fn prop_insert_delta(content in prop::collection::vec(any::<u8>(), 1..100)) {
            let mut delta = Vec::new();
            delta.push(0); // source size 0
            let mut n = content.len();
            loop {
                let mut b = (n & 0x7F) as u8;
                n >>= 7;
                if n > 0 { b |= 0x80; }
                delta.push(b);
                if n == 0 { break; }
            }
            for chunk in content.chunks(0x7F) {
                delta.push(chunk.len() as u8);
                delta.extend_from_slice(chunk);
            }
            let out = apply_delta(b"", &delta).unwrap();
            prop_assert_eq!(out, content);
        }
    }
}
