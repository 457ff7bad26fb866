//! Pack construction: closure computation and binary serialization.

use crate::log::{log, LogEntry};
use crate::{Result, SyncError};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use haven_storage::{ObjectId, ObjectType, StorageError, TreeEntry, Vault};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::io::Write;
use tracing::debug;

const PACK_MAGIC: &[u8; 4] = b"PACK";
const PACK_VERSION: u32 = 2;

/// Acknowledgment that a peer already holds part of a ref's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// The requested ref.
    pub refname: String,
    /// The first walked commit found in the peer's have set.
    pub oid: ObjectId,
}

/// Output of a pack build.
#[derive(Debug)]
pub struct PackResult {
    /// The serialized pack stream.
    pub pack: Vec<u8>,
    /// Commits that became shallow boundaries during the walk.
    pub shallows: HashSet<ObjectId>,
    /// Previously-shallow commits the walk moved past.
    pub unshallows: HashSet<ObjectId>,
    /// Per-ref acknowledgments of the peer's haves.
    pub acks: Vec<Ack>,
}

/// Builds packs for a vault.
pub struct PackBuilder<'a> {
    vault: &'a Vault,
}

impl<'a> PackBuilder<'a> {
    pub fn new(vault: &'a Vault) -> Self {
        Self { vault }
    }

    /// Computes the commit/tree/blob closure for the requested refs, minus
    /// history the peer acknowledges having, and serializes it.
    ///
    /// `depth` bounds each ref's walk; commits cut off by the bound are
    /// reported in `shallows`. A walked commit found in `haves` stops that
    /// ref's descent and is recorded as an [`Ack`].
    pub fn pack_objects(
        &self,
        refs: &[String],
        depth: Option<usize>,
        haves: &HashSet<ObjectId>,
    ) -> Result<PackResult> {
        let mut shallows = HashSet::new();
        let mut unshallows = HashSet::new();
        let mut acks = Vec::new();

        // Commit oids in walk order, with the tree each one roots.
        let mut seen_commits = HashSet::new();
        let mut commits: Vec<(ObjectId, ObjectId)> = Vec::new();

        for refname in refs {
            let walk = log(self.vault, refname, depth, None)?;
            shallows.extend(&walk.shallows);
            unshallows.extend(&walk.unshallows);

            for entry in walk.entries {
                let info = match entry {
                    LogEntry::Commit(info) => info,
                    LogEntry::Unreadable { oid, .. } => {
                        return Err(StorageError::ObjectNotFound(oid.to_hex()).into());
                    }
                };
                if haves.contains(&info.id) {
                    // Everything beyond this point is already on the peer.
                    acks.push(Ack {
                        refname: refname.clone(),
                        oid: info.id,
                    });
                    break;
                }
                if seen_commits.insert(info.id) {
                    commits.push((info.id, info.tree));
                }
            }
        }

        // Previously-shallow commits never belong in a pack: their trees
        // are absent locally.
        commits.retain(|(oid, _)| !unshallows.contains(oid));

        let (trees, blobs) = self.tree_closure(commits.iter().map(|(_, tree)| *tree))?;

        let mut objects: Vec<ObjectId> = commits.iter().map(|(oid, _)| *oid).collect();
        objects.extend(trees);
        objects.extend(blobs);

        debug!(
            refs = refs.len(),
            objects = objects.len(),
            acks = acks.len(),
            "building pack"
        );
        let pack = self.serialize(&objects)?;
        Ok(PackResult {
            pack,
            shallows,
            unshallows,
            acks,
        })
    }

    /// Walks trees with an explicit stack, recording subtree and blob oids.
    /// Blob content is never read here; only the ids matter for the closure.
    fn tree_closure(
        &self,
        roots: impl Iterator<Item = ObjectId>,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)> {
        let mut trees = Vec::new();
        let mut blobs = Vec::new();
        let mut seen = HashSet::new();
        let mut blob_seen = HashSet::new();

        let mut stack: Vec<ObjectId> = roots.filter(|oid| seen.insert(*oid)).collect();
        while let Some(oid) = stack.pop() {
            trees.push(oid);
            let object = self.vault.objects.read_typed(&oid, ObjectType::Tree)?;
            for entry in TreeEntry::parse_tree(&object.data)? {
                if entry.is_tree() {
                    if seen.insert(entry.oid) {
                        stack.push(entry.oid);
                    }
                } else if blob_seen.insert(entry.oid) {
                    blobs.push(entry.oid);
                }
            }
        }
        Ok((trees, blobs))
    }

    /// Serializes objects into the v2 pack format: magic, version, count,
    /// then per object a varint type+size header followed by the zlib
    /// stream of its content, with a trailing SHA-1 over all prior bytes.
    fn serialize(&self, objects: &[ObjectId]) -> Result<Vec<u8>> {
        let count = u32::try_from(objects.len())
            .map_err(|_| SyncError::InvalidPack("too many objects for one pack".into()))?;

        let mut out = HashingWriter::new();
        out.write(PACK_MAGIC);
        out.write(&PACK_VERSION.to_be_bytes());
        out.write(&count.to_be_bytes());

        for oid in objects {
            let object = self.vault.objects.read_object(oid)?;
            out.write(&entry_header(object.kind, object.data.len()));

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&object.data)?;
            out.write(&encoder.finish()?);
        }
        Ok(out.finish())
    }
}

/// Encodes a pack entry header: type code in bits 4-6 of the first byte,
/// size in little-endian 4+7n bit chunks with continuation bits.
fn entry_header(kind: ObjectType, size: usize) -> Vec<u8> {
    let mut size = size;
    let mut byte = (kind.pack_type() << 4) | (size as u8 & 0x0f);
    size >>= 4;
    let mut header = Vec::with_capacity(4);
    while size > 0 {
        header.push(byte | 0x80);
        byte = size as u8 & 0x7f;
        size >>= 7;
    }
    header.push(byte);
    header
}

/// Accumulates pack bytes and their running SHA-1.
struct HashingWriter {
    buf: Vec<u8>,
    hasher: Sha1,
}

impl HashingWriter {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            hasher: Sha1::new(),
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.buf.extend_from_slice(bytes);
    }

    fn finish(mut self) -> Vec<u8> {
        let digest = self.hasher.finalize();
        self.buf.extend_from_slice(&digest);
        self.buf
    }
}

/// Structurally verifies a pack stream: header, version, and trailing
/// checksum. Returns the declared object count.
pub fn verify_pack(pack: &[u8]) -> Result<u32> {
    if pack.len() < 32 {
        return Err(SyncError::InvalidPack(format!(
            "pack too short: {} bytes",
            pack.len()
        )));
    }
    if &pack[0..4] != PACK_MAGIC {
        return Err(SyncError::InvalidPack("bad pack magic".into()));
    }
    let version = u32::from_be_bytes(pack[4..8].try_into().unwrap());
    if version != PACK_VERSION {
        return Err(SyncError::InvalidPack(format!(
            "unsupported pack version: {}",
            version
        )));
    }
    let count = u32::from_be_bytes(pack[8..12].try_into().unwrap());

    let body = &pack[..pack.len() - 20];
    let trailer = &pack[pack.len() - 20..];
    let digest = Sha1::digest(body);
    if digest.as_slice() != trailer {
        return Err(SyncError::InvalidPack("pack checksum mismatch".into()));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_storage::{Ident, LoadedPack, MemFs, PackCache, VaultFs, VaultObject};
    use std::sync::Arc;

    fn vault() -> Vault {
        let fs: Arc<dyn VaultFs> = Arc::new(MemFs::new());
        Vault::init(fs, "vault", "vault", Arc::new(PackCache::new())).unwrap()
    }

    fn commit_secret(vault: &Vault, name: &str, content: &str, timestamp: i64) -> ObjectId {
        let blob = VaultObject::blob(content.as_bytes().to_vec());
        vault.objects.put(&blob).unwrap();
        let tree = TreeEntry::encode_tree(&[TreeEntry {
            mode: "100644".into(),
            name: name.into(),
            oid: blob.id,
        }]);
        vault.objects.put(&tree).unwrap();
        let author = Ident::new("Alice", "alice@example.com", timestamp, "+0000");
        vault.commit(&tree.id, content, &author).unwrap()
    }

    fn build(
        vault: &Vault,
        depth: Option<usize>,
        haves: &[ObjectId],
    ) -> PackResult {
        PackBuilder::new(vault)
            .pack_objects(
                &["refs/heads/main".to_string()],
                depth,
                &haves.iter().copied().collect(),
            )
            .unwrap()
    }

    #[test]
    fn test_full_fetch_packs_reachable_closure() {
        let vault = vault();
        commit_secret(&vault, "db", "one", 100);
        commit_secret(&vault, "db", "two", 200);
        commit_secret(&vault, "db", "three", 300);

        let result = build(&vault, None, &[]);
        // 3 commits, 3 distinct trees, 3 distinct blobs.
        assert_eq!(verify_pack(&result.pack).unwrap(), 9);
        assert!(result.shallows.is_empty());
        assert!(result.acks.is_empty());
    }

    #[test]
    fn test_packed_objects_match_loose_reads() {
        let vault = vault();
        let c1 = commit_secret(&vault, "db", "one", 100);

        let result = build(&vault, None, &[]);
        let pack = LoadedPack::load(result.pack, &vault.objects).unwrap();

        let from_pack = pack.read_object(&c1, &vault.objects).unwrap();
        let from_loose = vault.objects.read_object(&c1).unwrap();
        assert_eq!(from_pack.kind, from_loose.kind);
        assert_eq!(from_pack.data, from_loose.data);
    }

    #[test]
    fn test_depth_one_packs_only_tip() {
        let vault = vault();
        commit_secret(&vault, "db", "one", 100);
        commit_secret(&vault, "db", "two", 200);
        let c3 = commit_secret(&vault, "db", "three", 300);

        let result = build(&vault, Some(1), &[]);
        assert_eq!(verify_pack(&result.pack).unwrap(), 3);
        assert_eq!(result.shallows, HashSet::from([c3]));
        assert!(result.shallows.is_disjoint(&result.unshallows));

        let pack = LoadedPack::load(result.pack, &vault.objects).unwrap();
        assert!(pack.read_object(&c3, &vault.objects).is_ok());
    }

    #[test]
    fn test_have_tip_short_circuits_to_empty_pack() {
        let vault = vault();
        commit_secret(&vault, "db", "one", 100);
        let c2 = commit_secret(&vault, "db", "two", 200);

        let result = build(&vault, None, &[c2]);
        assert_eq!(verify_pack(&result.pack).unwrap(), 0);
        assert_eq!(
            result.acks,
            vec![Ack {
                refname: "refs/heads/main".into(),
                oid: c2,
            }]
        );
    }

    #[test]
    fn test_have_mid_history_packs_newer_half() {
        let vault = vault();
        let c1 = commit_secret(&vault, "db", "one", 100);
        let c2 = commit_secret(&vault, "db", "two", 200);
        let c3 = commit_secret(&vault, "db", "three", 300);

        let result = build(&vault, None, &[c2]);
        assert_eq!(result.acks.len(), 1);
        assert_eq!(result.acks[0].oid, c2);

        let pack = LoadedPack::load(result.pack, &vault.objects).unwrap();
        assert!(pack.read_object(&c3, &vault.objects).is_ok());
        assert!(pack.read_object(&c2, &vault.objects).is_err());
        assert!(pack.read_object(&c1, &vault.objects).is_err());
    }

    #[test]
    fn test_shared_blob_appears_once() {
        let vault = vault();
        // Same secret content in both commits: one blob, two trees.
        let blob = VaultObject::blob(b"hunter2".to_vec());
        vault.objects.put(&blob).unwrap();
        for (name, ts) in [("a", 100i64), ("b", 200)] {
            let tree = TreeEntry::encode_tree(&[TreeEntry {
                mode: "100644".into(),
                name: name.into(),
                oid: blob.id,
            }]);
            vault.objects.put(&tree).unwrap();
            let author = Ident::new("Alice", "alice@example.com", ts, "+0000");
            vault.commit(&tree.id, name, &author).unwrap();
        }

        let result = build(&vault, None, &[]);
        // 2 commits + 2 trees + 1 blob.
        assert_eq!(verify_pack(&result.pack).unwrap(), 5);
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let vault = vault();
        commit_secret(&vault, "db", "one", 100);

        let mut pack = build(&vault, None, &[]).pack;
        let last = pack.len() - 1;
        pack[last] ^= 0xff;
        assert!(matches!(
            verify_pack(&pack),
            Err(SyncError::InvalidPack(_))
        ));
    }

    #[test]
    fn test_truncated_pack_rejected() {
        assert!(verify_pack(b"PACK").is_err());
        assert!(verify_pack(&[0u8; 40]).is_err());
    }

    #[test]
    fn test_entry_header_varint() {
        // Size 5 blob: fits the low nibble, single byte.
        assert_eq!(entry_header(ObjectType::Blob, 5), vec![0x35]);
        // Size 0x15 commit: needs one continuation byte.
        assert_eq!(entry_header(ObjectType::Commit, 0x15), vec![0x95, 0x01]);
        // Zero-size tree.
        assert_eq!(entry_header(ObjectType::Tree, 0), vec![0x20]);
    }
}
